//! Static target-description resources served through `qXfer`.

use crate::adi::{HaltReason, RunState};

/// Target description for the Cortex-M0+ cores.
pub(crate) const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
<architecture>arm</architecture>
<feature name="org.gnu.gdb.arm.m-profile">
<reg name="r0" bitsize="32" regnum="0"/>
<reg name="r1" bitsize="32"/>
<reg name="r2" bitsize="32"/>
<reg name="r3" bitsize="32"/>
<reg name="r4" bitsize="32"/>
<reg name="r5" bitsize="32"/>
<reg name="r6" bitsize="32"/>
<reg name="r7" bitsize="32"/>
<reg name="r8" bitsize="32"/>
<reg name="r9" bitsize="32"/>
<reg name="r10" bitsize="32"/>
<reg name="r11" bitsize="32"/>
<reg name="r12" bitsize="32"/>
<reg name="sp" bitsize="32" type="data_ptr"/>
<reg name="lr" bitsize="32"/>
<reg name="pc" bitsize="32" type="code_ptr"/>
<reg name="xpsr" bitsize="32" regnum="16"/>
</feature>
</target>
"#;

/// RP2040 memory map: boot ROM, XIP flash (4 KiB erase blocks), striped
/// SRAM and the peripheral space.
pub(crate) const MEMORY_MAP_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
<memory-map>
<memory type="rom" start="0x00000000" length="0x4000"/>
<memory type="flash" start="0x10000000" length="0x200000">
<property name="blocksize">0x1000</property>
</memory>
<memory type="ram" start="0x20000000" length="0x42000"/>
<memory type="ram" start="0x40000000" length="0x20000000"/>
<memory type="ram" start="0xd0000000" length="0x10000000"/>
<memory type="ram" start="0xe0000000" length="0x10000000"/>
</memory-map>
"#;

fn state_text(state: RunState, reason: HaltReason) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Unknown => "unknown",
        RunState::Halted => match reason {
            HaltReason::Breakpoint => "halted (breakpoint)",
            HaltReason::Step => "halted (step)",
            HaltReason::DebugRequest => "halted (debug-request)",
            HaltReason::Reset => "halted (reset)",
            HaltReason::Watchpoint => "halted (watchpoint)",
            HaltReason::ExceptionCatch => "halted (exception)",
            HaltReason::Unknown => "halted",
        },
    }
}

/// Thread-list document with the live state of both cores.
pub(crate) fn threads_xml(cores: [(RunState, HaltReason); 2]) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<threads>\n\
         <thread id=\"1\">Name: rp2040.core0, state: {}</thread>\n\
         <thread id=\"2\">Name: rp2040.core1, state: {}</thread>\n\
         </threads>\n",
        state_text(cores[0].0, cores[0].1),
        state_text(cores[1].0, cores[1].1),
    )
}
