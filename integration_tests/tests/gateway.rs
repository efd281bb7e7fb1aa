//! Gateway connection lifecycle over real TCP sockets: accept, byte
//! routing, response path, idle timeout, and re-accept.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use ferrocan_linux::stack::GatewayParser;
use ferrocan_linux::{EventLoop, Gateway, GatewayConfig};
use integration_tests::{free_tcp_port, RecordingParser};

const ITERATION_BUDGET: Duration = Duration::from_secs(10);

fn pump_until(
    ep: &mut EventLoop,
    gw: &mut Gateway,
    parser: &mut RecordingParser,
    mut done: impl FnMut(&Gateway, &RecordingParser) -> bool,
) -> bool {
    let deadline = Instant::now() + ITERATION_BUDGET;
    while Instant::now() < deadline {
        ep.wait();
        gw.process(ep, parser);
        parser.poll_response(&mut |buf| gw.write_response(buf));
        ep.finish_iteration();
        if done(gw, parser) {
            return true;
        }
    }
    false
}

#[test]
fn tcp_accept_feed_and_respond() {
    let mut ep = EventLoop::new(5_000).unwrap();
    let port = free_tcp_port();
    let mut gw = Gateway::new(ep.registry(), GatewayConfig::Tcp(port), 0).unwrap();
    let mut parser = RecordingParser::new();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));

    client.write_all(b"[1] r 0x1017 0\n").unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |_, p| !p.fed.is_empty()));
    assert_eq!(parser.fed, b"[1] r 0x1017 0\n");

    // response path back to the wire
    parser.respond(b"[1] OK\r\n");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |_, p| p
        .responses
        .is_empty()));
    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"[1] OK\r\n");
}

#[test]
fn idle_connection_times_out_and_next_client_is_admitted() {
    let mut ep = EventLoop::new(5_000).unwrap();
    let port = free_tcp_port();
    // 300 ms idle timeout
    let mut gw = Gateway::new(ep.registry(), GatewayConfig::Tcp(port), 300).unwrap();
    let mut parser = RecordingParser::new();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));

    // the client sends nothing; the gateway must drop it
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| !gw
        .has_connection()));

    // the client observes EOF
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    // the listener was re-armed: a second client gets in
    let _client2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));
}

#[test]
fn traffic_resets_the_idle_timer() {
    let mut ep = EventLoop::new(5_000).unwrap();
    let port = free_tcp_port();
    let mut gw = Gateway::new(ep.registry(), GatewayConfig::Tcp(port), 400).unwrap();
    let mut parser = RecordingParser::new();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));

    // keep sending a byte every 100 ms for over two timeout periods
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(1000) {
        client.write_all(b".").unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            ep.wait();
            gw.process(&mut ep, &mut parser);
            ep.finish_iteration();
        }
        assert!(gw.has_connection(), "dropped despite traffic");
    }
}

#[test]
fn client_disconnect_re_arms_listener() {
    let mut ep = EventLoop::new(5_000).unwrap();
    let port = free_tcp_port();
    let mut gw = Gateway::new(ep.registry(), GatewayConfig::Tcp(port), 0).unwrap();
    let mut parser = RecordingParser::new();

    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));
    drop(client);

    // EOF tears the connection down
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| !gw
        .has_connection()));

    let _client2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&mut ep, &mut gw, &mut parser, |gw, _| gw
        .has_connection()));
}

#[test]
fn responses_are_purged_without_connection() {
    let mut ep = EventLoop::new(5_000).unwrap();
    let port = free_tcp_port();
    let mut gw = Gateway::new(ep.registry(), GatewayConfig::Tcp(port), 0).unwrap();
    let mut parser = RecordingParser::new();

    parser.respond(b"nobody listening\r\n");
    parser.poll_response(&mut |buf| gw.write_response(buf));
    assert!(parser.responses.is_empty());
}
