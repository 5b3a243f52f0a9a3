//! Interrupt/exception event descriptors and the per-vCPU pending queue.

use bit_field::BitField;

use crate::vmx::VmxInterruptionType;

/// One interrupt or exception occurrence to be delivered into the guest.
///
/// A descriptor is produced either by a caller requesting injection of a
/// known event, or by decoding the exit-time interruption-information fields
/// (see [`VmxVcpu::exit_event`](crate::VmxVcpu::exit_event)). It is consumed
/// exactly once: encoded into the VM-entry fields, or queued and encoded on a
/// later interrupt-window exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Interrupt or exception number (0-255).
    pub vector: u8,
    /// Interruption type written to bits 10:8 of the interruption-information
    /// field.
    pub int_type: VmxInterruptionType,
    /// Exception error code. Must be `Some` exactly for the hardware
    /// exception vectors that architecturally deliver one (see
    /// [`InterruptEvent::requires_error_code`]).
    pub err_code: Option<u32>,
    /// Bytes to advance the saved return address past the triggering
    /// instruction, used only for software interruption types. `None` means
    /// "resolve from the exiting instruction's length at encode time".
    pub rip_adjust: Option<u32>,
}

impl InterruptEvent {
    /// Build an event for `vector`, deriving the interruption type from the
    /// vector number.
    pub fn from_vector(vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type: VmxInterruptionType::from_vector(vector),
            err_code,
            rip_adjust: None,
        }
    }

    /// Decode an event from a raw interruption-information field.
    ///
    /// `err_code` is the content of the matching error-code field; it is
    /// ignored unless the error-code-valid bit of `info` is set. Returns
    /// `None` when the valid bit is clear (no event occurred).
    pub fn from_raw(info: u32, err_code: Option<u32>, rip_adjust: Option<u32>) -> Option<Self> {
        if !info.get_bit(31) {
            return None;
        }
        let int_type = VmxInterruptionType::try_from(info.get_bits(8..11) as u8)
            .expect("3-bit interruption type is always in range");
        Some(Self {
            vector: info.get_bits(0..8) as u8,
            int_type,
            err_code: if info.get_bit(11) { err_code } else { None },
            rip_adjust,
        })
    }

    /// Encoding of this event for the VM-entry interruption-information
    /// field. (SDM Vol. 3C, Section 24.8.3, Table 24-13)
    pub fn bits(&self) -> u32 {
        let mut info = self.vector as u32;
        info.set_bits(8..11, self.int_type as u32);
        info.set_bit(11, self.err_code.is_some());
        info.set_bit(31, true);
        info
    }

    /// Whether the architecture mandates an error code for this event.
    ///
    /// Only hardware exceptions deliver error codes: #TS, #NP, #SS, #GP and
    /// #PF carry a caller-supplied code, #DF and #AC always carry zero.
    pub fn requires_error_code(&self) -> bool {
        self.int_type == VmxInterruptionType::HardException
            && VmxInterruptionType::vector_has_error_code(self.vector)
    }

    /// The value for the VM-entry instruction-length field, or `None` when
    /// this event type delivers with the unmodified guest `RIP`.
    ///
    /// For software interruption types an unresolved adjustment falls back to
    /// `exit_instruction_length`, the length of the instruction that caused
    /// the current VM-exit.
    pub fn entry_instruction_length(&self, exit_instruction_length: u32) -> Option<u32> {
        if self.int_type.is_soft() {
            Some(self.rip_adjust.unwrap_or(exit_instruction_length))
        } else {
            None
        }
    }
}

/// Capacity of the per-vCPU pending event queue.
const PENDING_EVENT_CAPACITY: usize = 32;

/// A bounded ring of events waiting for the guest to become interruptible.
///
/// The queue is owned by exactly one vCPU and touched only between a VM-exit
/// and the following VM-entry on that processor, so it needs no locking and
/// no allocation. `push_back` keeps arrival order; `push_front` preempts
/// everything already queued (most recent first). Overflow and underflow are
/// contract violations and abort.
#[derive(Debug)]
pub struct PendingEventQueue {
    events: [Option<InterruptEvent>; PENDING_EVENT_CAPACITY],
    head: usize,
    count: usize,
}

impl PendingEventQueue {
    pub const fn new() -> Self {
        Self {
            events: [None; PENDING_EVENT_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub const fn capacity(&self) -> usize {
        PENDING_EVENT_CAPACITY
    }

    /// Append `event` behind all queued events.
    pub fn push_back(&mut self, event: InterruptEvent) {
        assert!(
            self.count < PENDING_EVENT_CAPACITY,
            "pending event queue overflow"
        );
        let tail = (self.head + self.count) % PENDING_EVENT_CAPACITY;
        self.events[tail] = Some(event);
        self.count += 1;
    }

    /// Insert `event` in front of all queued events, so it is delivered next.
    pub fn push_front(&mut self, event: InterruptEvent) {
        assert!(
            self.count < PENDING_EVENT_CAPACITY,
            "pending event queue overflow"
        );
        self.head = if self.head == 0 {
            PENDING_EVENT_CAPACITY - 1
        } else {
            self.head - 1
        };
        self.events[self.head] = Some(event);
        self.count += 1;
    }

    /// Remove and return the next event to deliver. Callers must check
    /// [`PendingEventQueue::is_empty`] first.
    pub fn pop_front(&mut self) -> InterruptEvent {
        let event = self.events[self.head]
            .take()
            .expect("pending event queue underflow");
        self.head += 1;
        self.count -= 1;
        // Wrap, and park the head at slot 0 while empty so the indices stay
        // bounded for diagnostics.
        if self.count == 0 || self.head == PENDING_EVENT_CAPACITY {
            self.head = 0;
        }
        event
    }
}

impl Default for PendingEventQueue {
    fn default() -> Self {
        Self::new()
    }
}
