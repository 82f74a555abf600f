use super::*;

#[test]
fn test_nibble_helpers() {
    assert_eq!(nibble_value(status::NOTE_ON, channel::CHANNEL_10), 0x99);
    assert_eq!(high_nibble(0x99), 0x9);
    assert_eq!(low_nibble(0x9a), 0xa);
}

#[test]
fn test_long_value_helpers() {
    let value = long_value(0x40, 0x00);
    assert_eq!(value, 0x2000);
    assert_eq!(msb(value), 0x40);
    assert_eq!(lsb(value), 0x00);
    assert_eq!(long_value(0x7f, 0x7f), 0x3fff);
}

#[test]
fn test_as_bool() {
    assert_eq!(as_bool(0), MIDI_OFF);
    assert_eq!(as_bool(63), MIDI_OFF);
    assert_eq!(as_bool(64), MIDI_ON);
    assert_eq!(as_bool(127), MIDI_ON);
}

#[test]
fn test_message_constructors() {
    let note = MidiMessage::note_on(channel::CHANNEL_1, 60, 100);
    assert_eq!(note.as_bytes(), &[0x90, 60, 100]);
    assert_eq!(note.channel(), Some(0));

    let program = MidiMessage::program_change(channel::CHANNEL_16, 5);
    assert_eq!(program.as_bytes(), &[0xcf, 5]);

    let bend = MidiMessage::pitch_wheel(0, 0x2000);
    assert_eq!(bend.as_bytes(), &[0xe0, 0x00, 0x40]);

    let sysex = MidiMessage::system_exclusive(&[0x7e, 0x7f, 0x06, 0x01]);
    assert_eq!(sysex.as_bytes(), &[0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7]);
    assert!(sysex.is_system_exclusive());
    assert_eq!(sysex.channel(), None);
}

#[test]
fn test_real_time_requires_real_time_status() {
    assert!(MidiMessage::real_time(status::TIMING_CLOCK).unwrap().is_real_time());
    assert_eq!(
        MidiMessage::real_time(status::TUNE_REQUEST),
        Err(FormatError::NotRealTime(0xf6))
    );
}

#[test]
fn test_data_length_table() {
    assert_eq!(data_length(0x80), Some(2));
    assert_eq!(data_length(0xc3), Some(1));
    assert_eq!(data_length(0xd0), Some(1));
    assert_eq!(data_length(0xe5), Some(2));
    assert_eq!(data_length(status::SYSTEM_EXCLUSIVE), None);
    assert_eq!(data_length(status::TIME_CODE_QUARTER_FRAME), Some(1));
    assert_eq!(data_length(status::SONG_POSITION_POINTER), Some(2));
    assert_eq!(data_length(status::TUNE_REQUEST), Some(0));
    assert_eq!(data_length(status::ACTIVE_SENSING), Some(0));
}

#[test]
fn test_decode_with_explicit_status() {
    let (message, consumed) = StandardFormat.decode(&[0x90, 60, 100, 0x80], None).unwrap();
    assert_eq!(message, MidiMessage::note_on(0, 60, 100));
    assert_eq!(consumed, 3);
}

#[test]
fn test_decode_with_running_status() {
    let (message, consumed) = StandardFormat.decode(&[62, 90], Some(0x91)).unwrap();
    assert_eq!(message.as_bytes(), &[0x91, 62, 90]);
    assert_eq!(consumed, 2);
}

#[test]
fn test_decode_data_byte_without_status() {
    assert_eq!(
        StandardFormat.decode(&[62, 90], None),
        Err(FormatError::MissingStatus(62))
    );
}

#[test]
fn test_decode_truncated() {
    assert!(matches!(
        StandardFormat.decode(&[0xb0, 7], None),
        Err(FormatError::Truncated { status: 0xb0, needed: 2, have: 1 })
    ));
}

#[test]
fn test_decode_sysex_spans_to_end_marker() {
    let buf = [0xf0, 0x43, 0x10, 0x4c, 0xf7, 0x90, 1, 2];
    let (message, consumed) = StandardFormat.decode(&buf, None).unwrap();
    assert_eq!(consumed, 5);
    assert_eq!(message.as_bytes(), &buf[..5]);
}

#[test]
fn test_decode_unterminated_sysex() {
    assert_eq!(
        StandardFormat.decode(&[0xf0, 0x43, 0x90], None),
        Err(FormatError::UnterminatedSysEx(0x90))
    );
    assert!(matches!(
        StandardFormat.decode(&[0xf0, 0x43], None),
        Err(FormatError::Truncated { .. })
    ));
}

#[test]
fn test_running_status_rules() {
    assert_eq!(next_running_status(None, 0x93), Some(0x93));
    assert_eq!(next_running_status(Some(0x93), status::TIMING_CLOCK), Some(0x93));
    assert_eq!(next_running_status(Some(0x93), status::SONG_SELECT), None);
}

#[test]
fn test_from_bytes_rejects_trailing_data() {
    assert_eq!(
        MidiMessage::from_bytes(&[0xc0, 1, 2]),
        Err(FormatError::TrailingBytes { extra: 1 })
    );
    assert!(MidiMessage::from_bytes(&[0xc0, 1]).is_ok());
}
