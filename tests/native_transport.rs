mod common;

use std::thread;
use std::time::{Duration, Instant};

use bioradio_link::locator::{ChannelSource, MAX_CHANNEL};
use bioradio_link::radio::{discover_services_with, AttemptOutcome};
use bioradio_link::{
    connect_with_backend, encode, BioRadio, ConnectOptions, FirmwareVersion, NativeRadioTransport,
    OpenMode, TransportError, TransportPort, TransportState,
};

use common::{test_config, ChannelBehavior, SimBackend, ADDRESS, ECONNREFUSED, EHOSTDOWN};

fn open_on(backend: SimBackend) -> NativeRadioTransport<SimBackend> {
    let mut transport = NativeRadioTransport::with_backend(test_config(), backend);
    transport.open().unwrap();
    transport
}

#[test]
fn failed_sdp_channel_falls_through_to_the_next_one() {
    let backend = SimBackend::new()
        .with_spp_records(&[3, 7])
        .with_channel(3, ChannelBehavior::Reject(ECONNREFUSED))
        .with_channel(7, ChannelBehavior::Open);

    let transport = open_on(backend.clone());
    assert_eq!(transport.channel_id(), Some(7));
    assert_eq!(transport.state(), TransportState::Open);
    assert_eq!(
        transport.channel().map(|c| c.source),
        Some(ChannelSource::SdpDiscovered)
    );

    let diag = transport.diagnostics().unwrap();
    assert_eq!(diag.opened_channel, Some(7));
    assert_eq!(diag.attempted_channels(), vec![3, 7]);
    assert_eq!(
        diag.failure_codes(),
        vec![(3, ECONNREFUSED), (3, ECONNREFUSED)]
    );
    assert_eq!(
        backend.lock().opens,
        vec![(3, OpenMode::Sync), (3, OpenMode::Async), (7, OpenMode::Sync)]
    );
}

#[test]
fn async_open_is_tried_when_sync_is_rejected() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::OpenAsyncOnly);
    let transport = open_on(backend);

    let diag = transport.diagnostics().unwrap();
    assert_eq!(transport.channel_id(), Some(1));
    assert_eq!(diag.attempts.len(), 2);
    assert_eq!(
        diag.attempts[0].outcome,
        AttemptOutcome::Rejected { code: EHOSTDOWN }
    );
    assert_eq!(diag.attempts[1].mode, OpenMode::Async);
    assert_eq!(diag.attempts[1].outcome, AttemptOutcome::Opened);
    assert_eq!(diag.attempts[1].source, ChannelSource::UserSpecified);
}

#[test]
fn callback_failure_is_recorded_and_sweep_continues() {
    let backend = SimBackend::new()
        .with_channel(1, ChannelBehavior::FailCallback(EHOSTDOWN))
        .with_channel(2, ChannelBehavior::Open);
    let transport = open_on(backend);

    let diag = transport.diagnostics().unwrap();
    assert_eq!(transport.channel_id(), Some(2));
    assert_eq!(
        transport.channel().map(|c| c.source),
        Some(ChannelSource::BruteForce)
    );
    assert!(diag
        .attempts
        .iter()
        .any(|a| a.channel == 1 && a.outcome == AttemptOutcome::Failed { code: EHOSTDOWN }));
}

#[test]
fn every_channel_failing_reports_full_diagnostics() {
    let backend = SimBackend::new().with_spp_records(&[5]);
    let mut transport = NativeRadioTransport::with_backend(test_config(), backend.clone());

    let diag = match transport.open() {
        Err(TransportError::NoChannelAvailable(diag)) => diag,
        other => panic!("expected NoChannelAvailable, got {other:?}"),
    };
    assert_eq!(diag.address, ADDRESS);
    assert_eq!(diag.backend, "sim");
    assert_eq!(diag.opened_channel, None);
    assert_eq!(diag.attempts.len(), 2 * MAX_CHANNEL as usize);

    let attempted = diag.attempted_channels();
    assert_eq!(attempted.len(), MAX_CHANNEL as usize);
    assert_eq!(&attempted[..3], &[5, 1, 2]);
    assert!(matches!(transport.state(), TransportState::Failed(_)));
    assert!(backend.lock().baseband_closed);

    transport.close();
    assert_eq!(transport.state(), TransportState::Closed);
}

#[test]
fn baseband_failure_is_a_connect_error() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    backend.lock().baseband_error = Some("page timeout".into());

    let mut transport = NativeRadioTransport::with_backend(test_config(), backend.clone());
    let err = transport.open().unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    assert!(err.is_retryable());
    assert!(backend.lock().opens.is_empty());
}

#[test]
fn read_returns_empty_after_timeout() {
    let mut transport = open_on(SimBackend::new().with_channel(1, ChannelBehavior::Open));

    let started = Instant::now();
    let bytes = transport.read(64, Duration::from_millis(100)).unwrap();
    let elapsed = started.elapsed();

    assert!(bytes.is_empty());
    assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
}

#[test]
fn inbound_bytes_reach_the_reader() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let mut transport = open_on(backend.clone());

    backend.push_inbound(&[0xF0, 0x31, 0x00]);
    let bytes = transport.read(64, Duration::from_secs(1)).unwrap();
    assert_eq!(bytes, vec![0xF0, 0x31, 0x00]);
    assert_eq!(transport.bytes_available(), 0);
}

#[test]
fn native_calls_run_on_one_executor_thread() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let mut transport = open_on(backend.clone());

    assert_eq!(transport.write(&[0xF0, 0x30]).unwrap(), 2);
    transport.close();

    let state = backend.lock();
    assert_eq!(state.written, vec![0xF0, 0x30]);
    assert!(state.calls.iter().any(|(call, _)| *call == "write"));
    let threads = state.native_threads();
    assert_eq!(threads.len(), 1, "{:?}", state.calls);
    assert_ne!(threads[0], thread::current().id());
}

const SAMPLE_FRAME: [u8; 9] = [0xF0, 0xF6, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

#[test]
fn short_writes_are_retried_until_the_buffer_is_sent() {
    let backend = SimBackend::new()
        .with_channel(1, ChannelBehavior::Open)
        .accepting_per_write(1);
    let mut transport = open_on(backend.clone());

    assert_eq!(transport.write(&SAMPLE_FRAME).unwrap(), SAMPLE_FRAME.len());

    let state = backend.lock();
    assert_eq!(state.written, SAMPLE_FRAME);
    let writes = state.calls.iter().filter(|(call, _)| *call == "write").count();
    assert_eq!(writes, SAMPLE_FRAME.len());
}

#[test]
fn stalled_write_times_out_with_progress() {
    let backend = SimBackend::new()
        .with_channel(1, ChannelBehavior::Open)
        .stalling_after(2);
    let mut config = test_config();
    config.write_timeout = Duration::from_millis(200);
    let mut transport = NativeRadioTransport::with_backend(config, backend.clone());
    transport.open().unwrap();

    let started = Instant::now();
    let err = transport.write(&SAMPLE_FRAME).unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        TransportError::Timeout(message) => {
            assert!(message.contains("2 of 9 bytes"), "{message}");
            assert!(message.contains("200ms"), "{message}");
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    assert_eq!(backend.lock().written, &SAMPLE_FRAME[..2]);
}

#[test]
fn remote_close_surfaces_as_disconnected() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let mut transport = open_on(backend.clone());

    backend.push_inbound(&[0x01, 0x02]);
    backend.close_remote();

    let bytes = transport.read(64, Duration::from_secs(1)).unwrap();
    assert_eq!(bytes, vec![0x01, 0x02]);
    assert!(matches!(
        transport.read(64, Duration::from_secs(1)),
        Err(TransportError::Disconnected)
    ));
    assert_eq!(transport.state(), TransportState::Closed);
    assert!(matches!(
        transport.write(&[0xF0, 0x30]),
        Err(TransportError::NotOpen)
    ));
}

#[test]
fn close_is_idempotent() {
    let mut transport = open_on(SimBackend::new().with_channel(1, ChannelBehavior::Open));
    transport.close();
    transport.close();
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(transport.channel_id(), None);
    assert!(matches!(
        transport.read(8, Duration::from_millis(10)),
        Err(TransportError::NotOpen)
    ));
}

#[test]
fn transport_can_reopen_after_close() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let mut transport = open_on(backend);
    transport.close();
    transport.open().unwrap();
    assert_eq!(transport.channel_id(), Some(1));
    assert_eq!(transport.describe(), format!("rfcomm:{ADDRESS}#1"));
}

#[test]
fn missing_address_is_a_config_error() {
    let mut config = test_config();
    config.address = None;
    let mut transport = NativeRadioTransport::with_backend(config, SimBackend::new());
    assert!(matches!(transport.open(), Err(TransportError::Config(_))));
}

#[test]
fn serial_path_that_cannot_open_falls_back_to_native() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let options = ConnectOptions {
        radio: test_config(),
        probe_window: Duration::from_millis(50),
        probe_attempts: 1,
        ..Default::default()
    };

    let transport =
        connect_with_backend("/dev/does-not-exist-bioradio", &options, backend).unwrap();
    assert_eq!(transport.describe(), format!("rfcomm:{ADDRESS}#1"));
    assert!(transport.is_open());
}

#[cfg(unix)]
#[test]
fn silent_serial_port_falls_back_to_native() {
    use serialport::SerialPort;

    let (_master, slave) = serialport::TTYPort::pair().unwrap();
    let path = slave.name().unwrap();
    drop(slave);

    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let options = ConnectOptions {
        radio: test_config(),
        probe_window: Duration::from_millis(50),
        probe_attempts: 1,
        ..Default::default()
    };

    let transport = connect_with_backend(&path, &options, backend.clone()).unwrap();
    assert_eq!(transport.describe(), format!("rfcomm:{ADDRESS}#1"));
    assert!(transport.is_open());
    assert_eq!(backend.lock().opens, vec![(1, OpenMode::Sync)]);
}

#[test]
fn serial_failure_without_address_is_reported() {
    let mut options = ConnectOptions {
        radio: test_config(),
        ..Default::default()
    };
    options.radio.address = None;

    let err = connect_with_backend("/dev/does-not-exist-bioradio", &options, SimBackend::new())
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
}

#[test]
fn address_target_goes_straight_to_native() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    let mut options = ConnectOptions {
        radio: test_config(),
        ..Default::default()
    };
    options.radio.address = None;

    let transport = connect_with_backend(ADDRESS, &options, backend).unwrap();
    assert!(transport.is_open());
}

#[test]
fn firmware_query_over_native_transport() {
    let backend = SimBackend::new().with_channel(1, ChannelBehavior::Open);
    backend.queue_reply(encode(0xF, &[0x00, 0x00, 4, 7, 2, 1]).unwrap());
    let transport = open_on(backend.clone());

    let mut radio = BioRadio::new(Box::new(transport));
    let version = radio.firmware_version().unwrap();
    assert_eq!(
        version,
        FirmwareVersion {
            firmware: (4, 7),
            hardware: (2, 1)
        }
    );
    assert_eq!(version.to_string(), "FW=4.07 HW=2.01");
    assert_eq!(backend.lock().written, vec![0xF0, 0xF1, 0x00]);
}

#[test]
fn discovery_lists_records_and_candidate_order() {
    let backend = SimBackend::new().with_spp_records(&[3, 7]);
    let discovery = discover_services_with(&test_config(), backend.clone()).unwrap();

    assert_eq!(discovery.records.len(), 2);
    assert!(discovery.query_error.is_none());
    let ids: Vec<u8> = discovery.candidates.iter().map(|c| c.id).collect();
    assert_eq!(&ids[..4], &[3, 7, 1, 2]);
    assert_eq!(ids.len(), MAX_CHANNEL as usize);
    assert!(backend.lock().opens.is_empty());
    assert!(backend.lock().baseband_closed);
}

#[test]
fn failed_sdp_query_falls_back_to_sweep() {
    let backend = SimBackend::new().with_channel(4, ChannelBehavior::Open);
    backend.lock().sdp_error = Some("connection reset".into());

    let transport = open_on(backend);
    let diag = transport.diagnostics().unwrap();
    assert!(diag.discovery.query_error.is_some());
    assert!(diag.discovery.records.is_empty());
    assert_eq!(transport.channel_id(), Some(4));
}
