mod common;

use common::{init_tracing, mock_link};
use obu_core::devices::nfc::{spawn_scanner, CardEvent, CardReader, ReaderEvent};
use obu_core::devices::qr_scanner::{ScanEvent, TRIGGER_OFF, TRIGGER_ON};
use obu_core::devices::{
    Mboard, QrScanner, ReaderMode, ReaderState, SerialNfcReader, Terminal, TerminalAddress, Worker,
};
use obu_core::protocol::{epdi, ProtocolError};
use pretty_assertions::assert_eq;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const CARD_PAYLOAD: [u8; 18] = [
    0x72, 0xE3, 0x01, 0xF2, 0x00, 0x00, 0x04, 0x88, 0x04, 0x12, 0x34, 0x9A, 0x56, 0x78, 0x9A, 0xBC,
    0xCD, 0x08,
];

fn next_card<C>(worker: &mut Worker<C, ReaderEvent>, within: Duration) -> Option<CardEvent> {
    let deadline = Instant::now() + within;
    let events = worker.events()?;
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(ReaderEvent::Card(card)) => return Some(card),
            Ok(ReaderEvent::Log(_)) => {}
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
    None
}

// Main board

#[test]
fn mboard_alive_round_trip() {
    init_tracing();
    let (link, mock) = mock_link();
    mock.reply_with(epdi::encode(&[
        0x72, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x00,
        0x0E, 0x10,
    ]));

    let mut mboard = Mboard::new(link);
    let alive = mboard.alive().unwrap();

    assert_eq!(alive.status, 1);
    assert_eq!(alive.hw_version, 2);
    assert_eq!(alive.sw_version, 3);
    assert_eq!(alive.bootloader_version, 4);
    assert_eq!(alive.uptime_seconds, 3600);
    assert_eq!(mock.writes(), vec![epdi::encode(&[0xF2, 0x00, 0x00, 0x00])]);
    assert_eq!(mboard.counter(), 1);
}

#[test]
fn mboard_read_registers_uses_counter() {
    let (link, mock) = mock_link();
    mock.reply_with(epdi::encode(&[0x72, 0x00, 0x00, 0x00, 0x00]))
        .reply_with(epdi::encode(&[0x72, 0x30, 0x00, 0x01, 0x00, 0xAA, 0x10, 0xBB]));

    let mut mboard = Mboard::new(link);
    // Short ALIVE reply is rejected but still consumes a counter value
    assert_eq!(mboard.alive(), Err(ProtocolError::InvalidResponse));
    assert_eq!(mboard.read_registers(0x10, 3).unwrap(), vec![0xAA, 0x10, 0xBB]);

    let writes = mock.writes();
    assert_eq!(writes[1], epdi::encode(&[0xF2, 0x30, 0x00, 0x01, 0x10, 0x03]));
}

#[test]
fn mboard_reports_crc_mismatch_and_timeout() {
    let (link, mock) = mock_link();
    let mut reply = epdi::encode(&[0x72, 0x30, 0x00, 0x00, 0x00, 0x01]);
    let last = reply.len() - 1;
    reply[last] ^= 0x01;
    mock.reply_with(reply);

    let mut mboard = Mboard::new(link);
    assert!(matches!(
        mboard.read_registers(0, 1),
        Err(ProtocolError::CrcMismatch { .. })
    ));
    assert_eq!(mboard.read_registers(0, 1), Err(ProtocolError::Timeout));
}

#[test]
fn write_failure_is_write_error() {
    let (link, mock) = mock_link();
    mock.fail_writes();
    let mut mboard = Mboard::new(link);
    assert!(matches!(mboard.alive(), Err(ProtocolError::WriteError(_))));
}

// Terminal

#[test]
fn terminal_alive_skips_echo_frame() {
    let (link, mock) = mock_link();
    let mut reply = epdi::encode(&[0xB1, 0x00]);
    reply.extend(epdi::encode(&[
        0x31, 0x00, 0x00, 0x00, 0x00, 0x07, 0x01, 0x02, 0x00, 0x09,
    ]));
    mock.reply_with(reply);

    let mut terminal = Terminal::new(link);
    let alive = terminal.alive(TerminalAddress::TerminalB).unwrap();

    assert_eq!(alive.status, 0);
    assert_eq!(alive.hw_version, 7);
    assert_eq!(alive.sw_version, 0x0102);
    assert_eq!(alive.bootloader_version, 9);
    assert_eq!(mock.writes(), vec![epdi::encode(&[0xB1, 0x00])]);
}

#[test]
fn terminal_alive_skips_noise_before_echo() {
    let (link, mock) = mock_link();
    let mut reply = vec![0x00];
    reply.extend(epdi::encode(&[0xB0, 0x00]));
    reply.extend(epdi::encode(&[
        0x30, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00, 0x05,
    ]));
    mock.reply_with(reply);

    let mut terminal = Terminal::new(link);
    let alive = terminal.alive(TerminalAddress::TerminalA).unwrap();
    assert_eq!(alive.hw_version, 3);
    assert_eq!(alive.sw_version, 4);
    assert_eq!(alive.bootloader_version, 5);
}

#[test]
fn terminal_beep_and_write_registers_frames() {
    let (link, mock) = mock_link();
    mock.reply_with(epdi::encode(&[0x30, 0x31]))
        .reply_with(epdi::encode(&[0x32, 0x31]));

    let mut terminal = Terminal::new(link);
    terminal.beep(TerminalAddress::TerminalA).unwrap();
    terminal
        .write_registers(TerminalAddress::AdapterA, 0x05, &[0x01, 0x02])
        .unwrap();
    assert_eq!(
        terminal.beep(TerminalAddress::AdapterB),
        Err(ProtocolError::Timeout)
    );

    assert_eq!(
        mock.writes(),
        vec![
            epdi::encode(&[0xB0, 0x31]),
            epdi::encode(&[0xB2, 0x31, 0x05, 0x01, 0x02]),
            epdi::encode(&[0xB3, 0x31]),
        ]
    );
}

// QR scanner

#[test]
fn qr_scan_once_always_turns_trigger_off() {
    let (link, mock) = mock_link();
    mock.reply_with(b"ABC-123\x06.".to_vec());

    let mut scanner = QrScanner::new(link);
    assert_eq!(scanner.scan_once(Duration::from_millis(300)).unwrap(), "ABC-123");
    assert_eq!(
        scanner.scan_once(Duration::from_millis(100)),
        Err(ProtocolError::Timeout)
    );

    let writes = mock.writes();
    assert_eq!(
        writes,
        vec![
            TRIGGER_ON.to_vec(),
            TRIGGER_OFF.to_vec(),
            TRIGGER_ON.to_vec(),
            TRIGGER_OFF.to_vec(),
        ]
    );
}

#[test]
fn qr_no_read_is_device_error() {
    let (link, mock) = mock_link();
    mock.reply_with(b"NR".to_vec());
    let mut scanner = QrScanner::new(link);
    assert!(matches!(
        scanner.scan_once(Duration::from_millis(300)),
        Err(ProtocolError::DeviceError(_))
    ));
}

#[test]
fn qr_device_info_query() {
    let (link, mock) = mock_link();
    mock.reply_with(b"REVINF: FW 1.2.3\r\n".to_vec());
    let mut scanner = QrScanner::new(link);
    assert_eq!(scanner.device_info().unwrap(), "REVINF: FW 1.2.3");
    assert_eq!(mock.writes()[0], b"\x16\x4D\x0DREVINF".to_vec());
}

#[test]
fn qr_continuous_suppresses_repeats() {
    init_tracing();
    let (link, mock) = mock_link();
    mock.reply_with(b"CODE1\r\n".to_vec())
        .reply_with(b"CODE1\r\n".to_vec())
        .reply_with(b"CODE2\r\n".to_vec());

    let mut worker = QrScanner::new(link).start_continuous(8).unwrap();
    thread::sleep(Duration::from_millis(500));
    let mut events = worker.take_events().unwrap();
    let (_scanner, outcome) = worker.stop().unwrap();
    assert_eq!(outcome, Ok(()));

    let mut codes = Vec::new();
    while let Ok(ScanEvent { code, .. }) = events.try_recv() {
        codes.push(code);
    }
    assert_eq!(codes, vec!["CODE1".to_string(), "CODE2".to_string()]);
    assert_eq!(mock.writes().last().unwrap(), &TRIGGER_OFF.to_vec());
}

// Serial NFC reader

#[test]
fn authenticated_reader_forwards_key() {
    let (link, mock) = mock_link();
    mock.reply_with(vec![0xF2, 0x02, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF])
        .reply_with(vec![0x72, 0x03, 0x01, 0x00]);

    let mut reader = SerialNfcReader::new(link, ReaderMode::Authenticated);
    reader.initialize().unwrap();
    assert_eq!(reader.state(), ReaderState::Ready);

    // Already ready: no second handshake
    reader.initialize().unwrap();
    assert_eq!(
        mock.writes(),
        vec![
            vec![0xF2, 0x02, 0x00],
            vec![0xF2, 0x03, 0x01, 0xDE, 0xAD, 0xBE, 0xEF],
        ]
    );
}

#[test]
fn silent_auth_continues_with_empty_key() {
    let (link, mock) = mock_link();
    let mut reader = SerialNfcReader::new(link, ReaderMode::Authenticated);
    reader.initialize().unwrap();
    assert_eq!(mock.writes()[1], vec![0xF2, 0x03, 0x01]);
}

#[test]
fn auth_write_failure_is_nfc_auth() {
    let (link, mock) = mock_link();
    mock.fail_writes();
    let mut reader = SerialNfcReader::new(link, ReaderMode::Authenticated);
    assert_eq!(reader.initialize(), Err(ProtocolError::NfcAuth));
    assert_eq!(reader.state(), ReaderState::Uninitialized);
}

#[test]
fn authenticated_scan_reports_card_and_rearms() {
    init_tracing();
    let (link, mock) = mock_link();
    mock.reply_with(vec![0xF2, 0x02, 0x00, 0x00, 0x01])
        .reply_with(vec![0x72, 0x03, 0x01, 0x00]);

    let mut reader = SerialNfcReader::new(link, ReaderMode::Authenticated);
    reader.initialize().unwrap();

    // A status frame precedes the card record in reply to ENABLE
    let mut enable_reply = epdi::encode(&[0x72, 0x63, 0x02, 0xF2, 0x00]);
    enable_reply.extend(epdi::encode(&CARD_PAYLOAD));
    mock.reply_with(enable_reply);

    let mut worker = spawn_scanner(reader, 16).unwrap();
    let card = next_card(&mut worker, Duration::from_secs(2)).expect("card event");
    assert_eq!(card.uid_hex(), "04123456789ABC");
    match &card {
        CardEvent::Card { info, .. } => assert_eq!(info.sak, 0x08),
        other => panic!("unexpected event {:?}", other),
    }

    let (reader, outcome) = worker.stop().unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(reader.state(), ReaderState::Stopped);

    let enables: Vec<_> = mock
        .writes()
        .into_iter()
        .filter(|w| w[1] == 0x63)
        .collect();
    assert_eq!(enables, vec![vec![0xF2, 0x63, 0x02], vec![0xF2, 0x63, 0x03]]);
}

#[test]
fn passive_reader_only_listens() {
    let (link, mock) = mock_link();
    let mut reader = SerialNfcReader::new(link, ReaderMode::Passive);
    mock.feed(&[0x00, 0x00]);
    mock.feed(&epdi::encode(&CARD_PAYLOAD));

    let event = reader
        .read_card(Duration::from_secs(1), &CancellationToken::new())
        .unwrap();
    assert_eq!(event.uid_hex(), "04123456789ABC");
    assert!(mock.writes().is_empty());
}

#[test]
fn stop_returns_within_a_poll_interval() {
    let (link, _mock) = mock_link();
    let reader = SerialNfcReader::new(link, ReaderMode::Passive);
    let worker = spawn_scanner(reader, 4).unwrap();
    thread::sleep(Duration::from_millis(150));

    let started = Instant::now();
    let (_reader, outcome) = worker.stop().unwrap();
    assert_eq!(outcome, Ok(()));
    assert!(started.elapsed() < Duration::from_millis(250));
}

#[test]
fn read_failure_ends_scan() {
    let (link, mock) = mock_link();
    mock.fail_reads();
    let reader = SerialNfcReader::new(link, ReaderMode::Passive);
    let worker = spawn_scanner(reader, 4).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let (reader, outcome) = worker.stop().unwrap();
    assert!(matches!(outcome, Err(ProtocolError::ReadError(_))));
    assert_eq!(reader.state(), ReaderState::Stopped);
}

#[test]
fn single_card_read_times_out() {
    let (link, _mock) = mock_link();
    let mut reader = SerialNfcReader::new(link, ReaderMode::Passive);
    let started = Instant::now();
    assert_eq!(
        reader.read_single_card(Duration::from_millis(200), &CancellationToken::new()),
        Err(ProtocolError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_millis(200));
}
