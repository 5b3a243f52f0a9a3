use crate::{InterruptEvent, InterruptibilityState, PendingEventQueue, VmxInterruptionType};

fn external(vector: u8) -> InterruptEvent {
    InterruptEvent::from_vector(vector, None)
}

#[test]
fn test_queue_starts_empty() {
    let queue = PendingEventQueue::new();
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.capacity(), 32);
}

#[test]
fn test_queue_preserves_arrival_order() {
    let mut queue = PendingEventQueue::new();
    queue.push_back(external(0x20));
    queue.push_back(external(0x21));
    queue.push_back(external(0x22));

    assert_eq!(queue.len(), 3);
    assert_eq!(queue.pop_front().vector, 0x20);
    assert_eq!(queue.pop_front().vector, 0x21);
    assert_eq!(queue.pop_front().vector, 0x22);
    assert!(queue.is_empty());
}

#[test]
fn test_priority_events_preempt_queued_ones() {
    let mut queue = PendingEventQueue::new();
    queue.push_back(external(0x20));
    queue.push_front(external(0x30));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop_front().vector, 0x30);
    assert_eq!(queue.pop_front().vector, 0x20);
}

#[test]
fn test_priority_events_drain_most_recent_first() {
    let mut queue = PendingEventQueue::new();
    queue.push_back(external(0x20));
    queue.push_front(external(0x30));
    queue.push_front(external(0x31));

    assert_eq!(queue.pop_front().vector, 0x31);
    assert_eq!(queue.pop_front().vector, 0x30);
    assert_eq!(queue.pop_front().vector, 0x20);
}

#[test]
fn test_queue_wraps_around_capacity() {
    let mut queue = PendingEventQueue::new();
    // Advance the head into the ring, then push enough for the tail (and
    // later the head) to wrap past the last slot.
    for i in 0..24u8 {
        queue.push_back(external(i));
    }
    for i in 0..16u8 {
        assert_eq!(queue.pop_front().vector, i);
    }
    for i in 24..44u8 {
        queue.push_back(external(i));
    }
    assert_eq!(queue.len(), 28);
    for i in 16..44u8 {
        assert_eq!(queue.pop_front().vector, i);
    }
    assert!(queue.is_empty());
}

#[test]
fn test_queue_never_exceeds_capacity() {
    let mut queue = PendingEventQueue::new();
    for i in 0..32 {
        if i % 2 == 0 {
            queue.push_back(external(i));
        } else {
            queue.push_front(external(i));
        }
        assert!(queue.len() <= queue.capacity());
    }
    assert_eq!(queue.len(), 32);
}

#[test]
#[should_panic(expected = "overflow")]
fn test_queue_overflow_aborts() {
    let mut queue = PendingEventQueue::new();
    for i in 0..33 {
        queue.push_back(external(i));
    }
}

#[test]
#[should_panic(expected = "underflow")]
fn test_queue_underflow_aborts() {
    let mut queue = PendingEventQueue::new();
    queue.pop_front();
}

#[test]
fn test_interruption_type_from_vector() {
    assert_eq!(VmxInterruptionType::from_vector(2), VmxInterruptionType::NMI);
    // #BP and #OF are software exceptions.
    assert_eq!(
        VmxInterruptionType::from_vector(3),
        VmxInterruptionType::SoftException
    );
    assert_eq!(
        VmxInterruptionType::from_vector(4),
        VmxInterruptionType::SoftException
    );
    // All other exception vectors are hardware exceptions.
    assert_eq!(
        VmxInterruptionType::from_vector(6),
        VmxInterruptionType::HardException
    );
    assert_eq!(
        VmxInterruptionType::from_vector(14),
        VmxInterruptionType::HardException
    );
    // Beyond the exception range everything is an external interrupt.
    assert_eq!(
        VmxInterruptionType::from_vector(0x20),
        VmxInterruptionType::External
    );
    assert_eq!(
        VmxInterruptionType::from_vector(0x41),
        VmxInterruptionType::External
    );
}

#[test]
fn test_error_code_vector_table() {
    // #DF, #TS, #NP, #SS, #GP, #PF and #AC are the only vectors that
    // deliver an error code.
    let with_error_code = [8u8, 10, 11, 12, 13, 14, 17];
    for vector in 0..=255u8 {
        assert_eq!(
            VmxInterruptionType::vector_has_error_code(vector),
            with_error_code.contains(&vector),
            "vector {vector}"
        );
    }
    // Only #DF and #AC require it to be zero.
    for vector in 0..=255u8 {
        assert_eq!(
            VmxInterruptionType::vector_error_code_is_zero(vector),
            vector == 8 || vector == 17,
            "vector {vector}"
        );
    }
}

#[test]
fn test_requires_error_code_follows_type_and_vector() {
    assert!(InterruptEvent::from_vector(14, Some(0x2)).requires_error_code());
    assert!(InterruptEvent::from_vector(8, Some(0)).requires_error_code());
    // #UD never carries an error code.
    assert!(!InterruptEvent::from_vector(6, None).requires_error_code());
    // Vector 0x41 is an external interrupt, not a hardware exception.
    assert!(!external(0x41).requires_error_code());
    assert!(!external(2).requires_error_code());
}

#[test]
fn test_event_encoding_bit_patterns() {
    // #PF with error code: valid | hardware exception | deliver error code.
    let page_fault = InterruptEvent::from_vector(14, Some(0x2));
    assert_eq!(page_fault.bits(), (1 << 31) | (1 << 11) | (3 << 8) | 14);

    let nmi = external(2);
    assert_eq!(nmi.bits(), (1 << 31) | (2 << 8) | 2);

    let timer = external(0x41);
    assert_eq!(timer.bits(), (1 << 31) | 0x41);

    let breakpoint = InterruptEvent::from_vector(3, None);
    assert_eq!(breakpoint.bits(), (1 << 31) | (6 << 8) | 3);
}

#[test]
fn test_event_round_trip() {
    let raw = (1 << 31) | (1 << 11) | (3 << 8) | 13u32; // #GP with error code
    let event = InterruptEvent::from_raw(raw, Some(0x18), Some(4)).unwrap();
    assert_eq!(event.vector, 13);
    assert_eq!(event.int_type, VmxInterruptionType::HardException);
    assert_eq!(event.err_code, Some(0x18));
    assert_eq!(event.rip_adjust, Some(4));
    assert_eq!(event.bits(), raw);
}

#[test]
fn test_invalid_raw_info_produces_no_event() {
    // Valid bit clear: nothing happened, whatever the low bits contain.
    assert_eq!(InterruptEvent::from_raw(0x0000_0b0e, Some(0), None), None);
    assert_eq!(InterruptEvent::from_raw(0, None, None), None);
}

#[test]
fn test_error_code_ignored_without_valid_bit() {
    // The error-code-valid bit is clear, so the error-code field content is
    // stale and must not be attached to the event.
    let raw = (1 << 31) | 0x41u32;
    let event = InterruptEvent::from_raw(raw, Some(0xdead), None).unwrap();
    assert_eq!(event.err_code, None);
    assert_eq!(event.bits(), raw);
}

#[test]
fn test_rip_adjust_resolution_for_software_events() {
    // An unresolved adjustment falls back to the exiting instruction length.
    let breakpoint = InterruptEvent::from_vector(3, None);
    assert_eq!(breakpoint.rip_adjust, None);
    assert_eq!(breakpoint.entry_instruction_length(3), Some(3));

    // An explicit adjustment wins.
    let mut resolved = breakpoint;
    resolved.rip_adjust = Some(2);
    assert_eq!(resolved.entry_instruction_length(3), Some(2));
}

#[test]
fn test_no_rip_adjust_for_hardware_events() {
    // Hardware exceptions, NMIs and external interrupts deliver on the
    // unmodified guest RIP.
    assert_eq!(
        InterruptEvent::from_vector(14, Some(0)).entry_instruction_length(3),
        None
    );
    assert_eq!(external(2).entry_instruction_length(3), None);
    assert_eq!(external(0x41).entry_instruction_length(3), None);
}

#[test]
fn test_interruptibility_blocking_flags() {
    let state = InterruptibilityState::from_bits_truncate(0b0010);
    assert!(state.contains(InterruptibilityState::BLOCKING_BY_MOV_SS));
    assert!(!state.is_empty());

    let state = InterruptibilityState::from_bits_truncate(0);
    assert!(state.is_empty());
}
