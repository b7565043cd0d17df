mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use beacon_server::codec::reference::REQUEST_LEN;
use beacon_server::codec::{
    MeasurementType, ReferenceRequest, ReferenceResponse, ResponseValue, Signal, ACK,
    KEEP_ALIVE, PROTOCOL_VERSION,
};
use beacon_server::dispatch::{DispatchReply, Dispatcher, DispatcherClient, RoutingTable};
use beacon_server::link::ReferenceLink;
use beacon_server::window::RecurrencePattern;

use common::{link_config, loopback, wait_until, Peer};

fn dispatcher(routes: RoutingTable) -> SocketAddr {
    let server = Dispatcher::new(routes).listen(&loopback("dispatcher")).unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn().unwrap();
    addr
}

fn client(addr: SocketAddr) -> DispatcherClient {
    DispatcherClient::connect(addr, Duration::from_secs(5)).unwrap()
}

fn station(id: u8, connect_wait: Duration) -> (Arc<ReferenceLink>, SocketAddr) {
    let mut config = link_config(&format!("reference-{id}"));
    config.connect_wait = connect_wait;
    let link = Arc::new(ReferenceLink::new(id, config));
    let server = link.listen(&loopback("reference")).unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn().unwrap();
    (link, addr)
}

#[test]
fn unknown_routing_id_is_refused() {
    let addr = dispatcher(RoutingTable::new());
    let mut client = client(addr);
    let reply = client
        .request(&ReferenceRequest::measure(9, MeasurementType::Temperature))
        .unwrap();
    assert_eq!(reply, DispatchReply::Rejected);
}

#[test]
fn routed_request_is_relayed_to_the_station() {
    let (link, station_addr) = station(3, Duration::from_secs(3));
    let mut hardware = Peer::connect(station_addr);
    wait_until("station connected", || link.link().is_connected());
    let addr = dispatcher([Arc::clone(&link)].into_iter().collect());

    let station = thread::spawn(move || {
        let request = hardware.read(6);
        hardware.send(&[ACK]);
        let response = ReferenceResponse::with_value(&ResponseValue::U16(1013));
        hardware.send(&response.encode().unwrap());
        request
    });

    let request = ReferenceRequest::measure(3, MeasurementType::Pressure);
    let reply = client(addr).request(&request).unwrap();
    let DispatchReply::Response(response) = reply else {
        panic!("request was refused");
    };
    assert_eq!(response.signal, Signal::Ack);
    assert_eq!(response.value().unwrap(), ResponseValue::U16(1013));
    assert_eq!(station.join().unwrap(), request.encode().to_vec());
    assert!(!link.link().is_busy());
}

#[test]
fn unreachable_station_yields_an_empty_nak_response() {
    let (link, _) = station(4, Duration::from_millis(100));
    let addr = dispatcher([link].into_iter().collect());

    let reply = client(addr)
        .request(&ReferenceRequest::measure(4, MeasurementType::Temperature))
        .unwrap();
    assert_eq!(reply, DispatchReply::Response(ReferenceResponse::unavailable()));
}

#[test]
fn malformed_request_is_closed_without_reply() {
    let addr = dispatcher(RoutingTable::new());
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    raw.write_all(&[0x02, 0x01, 0x05, 0x01, 0x01, 0x04]).unwrap();
    let mut reply = Vec::new();
    raw.read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());

    // The listener keeps serving afterwards.
    let reply = client(addr)
        .request(&ReferenceRequest::measure(1, MeasurementType::Temperature))
        .unwrap();
    assert_eq!(reply, DispatchReply::Rejected);
}

/// Acknowledge keep-alives until a request arrives. Every frame read must be
/// whole: a keep-alive or a request, never a mix of the two.
fn next_request(hardware: &mut Peer) -> (Vec<u8>, usize) {
    let mut keep_alives = 0;
    loop {
        let mut frame = hardware.read(1);
        if frame[0] == PROTOCOL_VERSION {
            frame.extend(hardware.read(REQUEST_LEN - 1));
            return (frame, keep_alives);
        }
        frame.extend(hardware.read(KEEP_ALIVE.len() - 1));
        assert_eq!(frame, KEEP_ALIVE);
        hardware.send(&[ACK]);
        keep_alives += 1;
    }
}

#[test]
fn keep_alives_never_interleave_with_relayed_requests() {
    let mut config = link_config("reference-6");
    config.keepalive_interval = Duration::from_millis(40);
    let link = Arc::new(ReferenceLink::new(6, config));
    let server = link.listen(&loopback("reference")).unwrap();
    let station_addr = server.local_addr().unwrap();
    server.spawn().unwrap();
    let mut hardware = Peer::connect(station_addr);
    wait_until("station connected", || link.link().is_connected());
    let addr = dispatcher([Arc::clone(&link)].into_iter().collect());

    let request = ReferenceRequest::measure(6, MeasurementType::Temperature);
    let expected = request.encode().to_vec();
    let station = thread::spawn(move || {
        let (frame, keep_alives) = next_request(&mut hardware);
        assert_eq!(frame, expected);
        hardware.send(&[ACK]);
        // The exchange holds the link: no keep-alive may cut in.
        assert!(hardware.is_quiet_for(Duration::from_millis(150)));
        let response = ReferenceResponse::with_value(&ResponseValue::F32(19.25));
        hardware.send(&response.encode().unwrap());

        let (frame, _) = next_request(&mut hardware);
        assert_eq!(frame, expected);
        hardware.send(&[ACK, 0x09, 0x06, 0x00, b'B']);
        keep_alives
    });

    thread::sleep(Duration::from_millis(150));
    let reply = client(addr).request(&request).unwrap();
    let DispatchReply::Response(response) = reply else {
        panic!("request was refused");
    };
    assert_eq!(response.value().unwrap(), ResponseValue::F32(19.25));

    thread::sleep(Duration::from_millis(100));
    let reply = client(addr).request(&request).unwrap();
    assert_eq!(reply, DispatchReply::Response(ReferenceResponse::unavailable()));
    assert!(station.join().unwrap() >= 2);
    assert!(!link.link().is_busy());
    wait_until("bad station dropped", || !link.link().is_connected());

    // The link is free again for the next hardware session.
    let mut hardware = Peer::connect(station_addr);
    wait_until("station reconnected", || link.link().is_connected());
    let station = thread::spawn(move || {
        next_request(&mut hardware);
        hardware.send(&[ACK]);
        let response = ReferenceResponse::with_value(&ResponseValue::U16(990));
        hardware.send(&response.encode().unwrap());
        hardware
    });
    let reply = client(addr).request(&request).unwrap();
    let DispatchReply::Response(response) = reply else {
        panic!("request was refused");
    };
    assert_eq!(response.value().unwrap(), ResponseValue::U16(990));
    drop(station.join().unwrap());
    assert!(!link.link().is_busy());
}

#[test]
fn dispatcher_reports_the_scoring_window() {
    let dispatcher = Dispatcher::new(RoutingTable::new());
    assert!(dispatcher.window_for(Utc::now()).is_none());

    let dispatcher = dispatcher.with_window(RecurrencePattern::new(vec![0, 900], 120));
    let inside = Utc.with_ymd_and_hms(2024, 5, 1, 12, 16, 30).unwrap();
    let window = dispatcher.window_for(inside).unwrap();
    assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 5, 1, 12, 13, 0).unwrap());
    assert!(dispatcher
        .window_for(Utc.with_ymd_and_hms(2024, 5, 1, 12, 7, 0).unwrap())
        .is_none());
}
