//! A [`GuestFaultSink`] with no guest kernel behind it. Guest syscall and
//! signal-delivery emulation are external collaborators ("Out of scope"),
//! so this crate's demo binary can't actually route a
//! guest fault to a guest-visible handler; instead it records what would
//! have been delivered and terminates the thread, so a standalone run of
//! the DBT core against a hand-supplied image always ends cleanly instead
//! of looping on an unhandled fault.

use std::cell::Cell;

use bt_exec::{terminate_current_thread, GuestFaultSink, GuestThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoFault {
    pub address: u32,
    pub was_read: bool,
    pub was_write: bool,
    pub is_mapper: bool,
}

pub struct DemoSink<'a> {
    thread: &'a GuestThread,
    pub last_fault: Cell<Option<DemoFault>>,
}

impl<'a> DemoSink<'a> {
    pub fn new(thread: &'a GuestThread) -> Self {
        Self {
            thread,
            last_fault: Cell::new(None),
        }
    }
}

impl<'a> GuestFaultSink for DemoSink<'a> {
    fn seg_mapper(&self, address: u32, was_read: bool, was_write: bool, from_handler: bool) -> ! {
        tracing::info!(address, was_read, was_write, from_handler, "seg_mapper: no guest kernel behind this demo, terminating");
        self.last_fault.set(Some(DemoFault { address, was_read, was_write, is_mapper: true }));
        terminate_current_thread(self.thread)
    }

    fn seg_access(&self, address: u32, was_read: bool, was_write: bool, from_handler: bool) -> ! {
        tracing::info!(address, was_read, was_write, from_handler, "seg_access: no guest kernel behind this demo, terminating");
        self.last_fault.set(Some(DemoFault { address, was_read, was_write, is_mapper: false }));
        terminate_current_thread(self.thread)
    }
}
