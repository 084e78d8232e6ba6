use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

use relay_camd35::{
    Answer, CardInfo, ClientConfig, ControlWord, DatagramLink, EcmRequest, Event, LinkKind,
    RelayError, Request, RequestSlots, ServerConfig, ServerSession, Session, StopReason,
    StreamLink,
};

const CW: ControlWord = ControlWord([
    0x10, 0x20, 0x30, 0x60, 0x40, 0x50, 0x60, 0xF0, 0x01, 0x02, 0x03, 0x06, 0x04, 0x05, 0x06, 0x0F,
]);
const TIMEOUT: Duration = Duration::from_secs(5);

fn request(index: u16) -> EcmRequest {
    EcmRequest {
        caid: 0x0500,
        provider_id: 0x023800,
        service_id: 0x0101,
        pid: 0x0064,
        index,
        payload: vec![0x80, 0x70, 0x01, 0xAA],
    }
}

fn server_config() -> ServerConfig {
    ServerConfig::new().with_account("user", "pass")
}

fn client_config(transport: LinkKind) -> ClientConfig {
    ClientConfig::new("user", "pass")
        .with_transport(transport)
        .with_read_timeout(TIMEOUT)
}

fn card() -> CardInfo {
    CardInfo {
        caid: 0x0500,
        serial: [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0, 0],
        ..Default::default()
    }
}

/// Answers the first request with a CW and the second with a stop.
fn serve<L: relay_camd35::Link>(mut server: ServerSession<L>) {
    let mut slots = RequestSlots::new(16);
    server.set_au_card(card());

    match server.receive(&mut slots, 5).unwrap() {
        Request::Ecm(ecm) => {
            assert_eq!(ecm.index, 5);
            assert_eq!(ecm.pid, 42);
            assert_eq!(ecm.service_id, 0x0101);
        }
        other => panic!("unexpected {other:?}"),
    }
    server.send_dcw(&mut slots, 5, Answer::Found(CW)).unwrap();

    assert!(matches!(
        server.receive(&mut slots, 6).unwrap(),
        Request::Ecm(_)
    ));
    server.send_dcw(&mut slots, 6, Answer::Sleep).unwrap();
}

fn run_client(mut client: Session) {
    client.send_request(&request(42)).unwrap();
    assert_eq!(
        client.receive().unwrap(),
        Event::ControlWord { index: 42, cw: CW }
    );
    match client.receive().unwrap() {
        Event::CardInfo(info) => {
            assert_eq!(info.caid, 0x0500);
            assert_eq!(info.serial, card().serial);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.receive().unwrap(), Event::Ignored);

    client.send_request(&request(43)).unwrap();
    assert_eq!(
        client.receive().unwrap(),
        Event::Stopped {
            index: 43,
            reason: StopReason::Sleep,
        }
    );
    assert_eq!(
        client.send_request(&request(44)),
        Err(RelayError::Stopped(StopReason::Sleep))
    );
}

#[test]
fn udp_round_trip() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = socket.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let link = DatagramLink::bound(socket);
        serve(ServerSession::new(link, &server_config()).unwrap());
    });

    let client = Session::open("127.0.0.1", port, client_config(LinkKind::Udp)).unwrap();
    run_client(client);
    server.join().unwrap();
}

#[test]
fn tcp_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut server = ServerSession::new(StreamLink::new(stream), &server_config()).unwrap();
        let mut slots = RequestSlots::default();
        assert!(matches!(
            server.receive(&mut slots, 0).unwrap(),
            Request::Ecm(_)
        ));
        server.send_dcw(&mut slots, 0, Answer::Found(CW)).unwrap();
        server.close();
    });

    let mut client = Session::open("127.0.0.1", port, client_config(LinkKind::Tcp)).unwrap();
    client.send_request(&request(7)).unwrap();
    assert_eq!(
        client.receive().unwrap(),
        Event::ControlWord { index: 7, cw: CW }
    );
    assert_eq!(client.receive().unwrap(), Event::PeerClosed);
    assert!(client.is_closed());
    server.join().unwrap();
}

#[test]
fn tcp_wrong_account() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut server = ServerSession::new(StreamLink::new(stream), &server_config()).unwrap();
        let mut slots = RequestSlots::default();
        server.receive(&mut slots, 0)
    });

    let config = ClientConfig::new("intruder", "pass")
        .with_transport(LinkKind::Tcp)
        .with_read_timeout(TIMEOUT);
    let mut client = Session::open("127.0.0.1", port, config).unwrap();
    client.send_request(&request(1)).unwrap();

    assert_eq!(server.join().unwrap(), Err(RelayError::UnknownUser));
    // Unread request bytes may turn the close into a reset.
    assert!(matches!(
        client.receive(),
        Ok(Event::PeerClosed) | Err(RelayError::Io(_))
    ));
}
