use alloc::string::String;

use embassy_time::Duration;

use super::*;
use crate::firmware::{
    meter::Sample,
    net::{Endpoint, TransportEvent, TransportEventKind},
    testing::{at_ms, Call, MockTransport},
    types::{ConnId, NetError},
};

const URL: &str = "http://collector.local:80/middleware.php";

fn client() -> Connection {
    let mut conn = Connection::client(
        ConnId(0),
        String::from("lwi0"),
        Endpoint::parse(URL).unwrap(),
        Duration::from_secs(30),
    );
    Uploader::install_headers(&mut conn);
    conn
}

fn channel_with(samples: &[(u64, f64)]) -> MeterChannel {
    let mut channel = MeterChannel::new("uuid-1", None);
    for &(ts_ms, value) in samples {
        channel.push(Sample { ts_ms, value });
    }
    channel
}

fn connected(conn: &mut Connection, transport: &mut MockTransport) {
    conn.handle_event(transport, TransportEventKind::Connected(Ok(())), at_ms(5));
    assert_eq!(conn.state(), ConnState::Ready);
}

fn reply(conn: &mut Connection, transport: &mut MockTransport, bytes: &[u8]) {
    let kind = TransportEvent::received(ConnId(0), bytes).kind;
    conn.handle_event(transport, kind, at_ms(50));
    assert_eq!(conn.state(), ConnState::Replied);
}

const OK_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}";

#[test]
fn batch_is_posted_and_acknowledged() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 1.5), (2_000, 2.25)])];
    let mut uploader = Uploader::new("/middleware.php");

    let first = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    assert_eq!(first, UploadProgress::InFlight);
    assert_eq!(conn.state(), ConnState::Connecting);
    assert!(uploader.is_busy());

    connected(&mut conn, &mut transport);
    let posted = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    assert_eq!(posted, UploadProgress::InFlight);
    assert_eq!(conn.state(), ConnState::Sending);

    let request = transport.last_write().unwrap();
    assert!(request.starts_with("POST /middleware.php/data/uuid-1.json HTTP/1.1\r\n"));
    assert!(request.contains("User-Agent: meterlink/"));
    assert!(request.contains("Accept: application/json\r\n"));
    assert!(request.ends_with("\r\n\r\n[[1000,1.50],[2000,2.25]]"));

    reply(&mut conn, &mut transport, OK_REPLY);
    let done = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(60));
    assert_eq!(done, UploadProgress::Delivered { samples: 2 });
    assert!(channels[0].is_empty());
    assert!(!uploader.is_busy());
    assert_eq!(conn.state(), ConnState::Init);
    assert!(conn.handle().is_none());

    let idle = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(70));
    assert_eq!(idle, UploadProgress::Idle);
}

#[test]
fn repeated_timestamps_are_sent_once() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 1.0), (1_000, 1.0)])];
    let mut uploader = Uploader::new("/middleware.php/");

    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    connected(&mut conn, &mut transport);
    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    assert!(transport.last_write().unwrap().ends_with("[[1000,1.00]]"));
    reply(&mut conn, &mut transport, OK_REPLY);
    assert_eq!(
        uploader.service(&mut conn, &mut transport, &mut channels, at_ms(20)),
        UploadProgress::Delivered { samples: 1 }
    );
    assert!(channels[0].is_empty());

    // Same timestamp as the last delivered sample: dropped without a request.
    channels[0].push(Sample {
        ts_ms: 1_000,
        value: 1.0,
    });
    transport.clear_calls();
    let next = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(30));
    assert_eq!(next, UploadProgress::Idle);
    assert!(channels[0].is_empty());
    assert_eq!(transport.count(|call| matches!(call, Call::Open { .. })), 0);
}

#[test]
fn rejected_batch_stays_buffered() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 7.0)])];
    let mut uploader = Uploader::new("/middleware.php");

    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    connected(&mut conn, &mut transport);
    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    reply(
        &mut conn,
        &mut transport,
        b"HTTP/1.1 400 Bad Request\r\n\r\n{\"exception\":\"bad uuid\"}",
    );

    let outcome = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(20));
    assert_eq!(outcome, UploadProgress::Failed(UploadError::Rejected(400)));
    assert_eq!(channels[0].len(), 1);
    assert!(!uploader.is_busy());
}

#[test]
fn garbage_reply_is_malformed() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 7.0)])];
    let mut uploader = Uploader::new("/middleware.php");

    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    connected(&mut conn, &mut transport);
    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    reply(&mut conn, &mut transport, b"hello");

    let outcome = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(20));
    assert_eq!(outcome, UploadProgress::Failed(UploadError::Malformed));
    assert_eq!(channels[0].len(), 1);
}

#[test]
fn unreachable_collector_gives_up_after_attempts() {
    let mut transport = MockTransport::new();
    transport.connect_result = Err(NetError::Route);
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 7.0)])];
    let mut uploader = Uploader::new("/middleware.php");

    for tick in 0..u64::from(UPLOAD_ATTEMPTS_MAX) {
        let progress = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(tick));
        assert_eq!(progress, UploadProgress::InFlight);
        assert_eq!(conn.state(), ConnState::Init);
    }
    let last = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    assert_eq!(last, UploadProgress::Failed(UploadError::Timeout));
    assert_eq!(channels[0].len(), 1);
    assert_eq!(
        transport.count(|call| matches!(call, Call::Connect(..))),
        usize::from(UPLOAD_ATTEMPTS_MAX)
    );
}

#[test]
fn full_send_buffer_is_retried() {
    let mut transport = MockTransport::new();
    transport.write_results.push_back(Err(NetError::Mem));
    let mut conn = client();
    let mut channels = [channel_with(&[(1_000, 7.0)])];
    let mut uploader = Uploader::new("/middleware.php");

    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    connected(&mut conn, &mut transport);
    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    assert_eq!(conn.state(), ConnState::Retry);
    assert!(transport.writes.is_empty());

    let progress = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(20));
    assert_eq!(progress, UploadProgress::InFlight);
    assert_eq!(conn.state(), ConnState::Sending);
    assert_eq!(transport.writes.len(), 1);
}

#[test]
fn batches_are_capped() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let samples: alloc::vec::Vec<(u64, f64)> = (0..70).map(|i| (1_000 + i, 1.0)).collect();
    let mut channels = [channel_with(&samples)];
    let mut uploader = Uploader::new("/middleware.php");

    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    connected(&mut conn, &mut transport);
    uploader.service(&mut conn, &mut transport, &mut channels, at_ms(10));
    reply(&mut conn, &mut transport, OK_REPLY);

    let outcome = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(20));
    assert_eq!(outcome, UploadProgress::Delivered { samples: UPLOAD_BATCH_MAX });
    assert_eq!(channels[0].len(), 70 - UPLOAD_BATCH_MAX);
}

#[test]
fn empty_channels_stay_idle() {
    let mut transport = MockTransport::new();
    let mut conn = client();
    let mut channels = [MeterChannel::new("uuid-1", None)];
    let mut uploader = Uploader::new("/middleware.php");

    assert!(!Uploader::ready(&channels));
    let progress = uploader.service(&mut conn, &mut transport, &mut channels, at_ms(0));
    assert_eq!(progress, UploadProgress::Idle);
    assert!(transport.calls.is_empty());
}
