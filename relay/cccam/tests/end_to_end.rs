use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use hex_literal::hex;

use relay_cccam::crypto::{CipherState, decode_cw, derive_keys};
use relay_cccam::{ClientConfig, ControlWord, EcmRequest, Event, RelayError, Session};

const SEED: [u8; 16] = hex!("101112131415161718191a1b1c1d1e1f");
const NODE: [u8; 8] = hex!("0102030405060708");
const CARD: u32 = 0x11223344;

/// Minimal CCcam server side of one connection.
struct Peer {
    stream: TcpStream,
    send: CipherState,
    recv: CipherState,
}

impl Peer {
    fn accept(listener: &TcpListener) -> Self {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(&SEED).unwrap();
        let keys = derive_keys(&SEED);
        Self {
            stream,
            send: keys.recv,
            recv: keys.send,
        }
    }

    /// Reads the login and returns the username field.
    fn read_login(&mut self, password: &[u8]) -> Vec<u8> {
        let mut login = [0u8; 46];
        self.stream.read_exact(&mut login).unwrap();
        self.recv.decrypt(&mut login[..40]);
        self.recv.encrypt(&mut password.to_vec());
        self.recv.decrypt(&mut login[40..]);
        assert_eq!(&login[40..], b"CCcam\0");
        login[20..40].to_vec()
    }

    fn write(&mut self, plain: &[u8]) {
        let mut buf = plain.to_vec();
        self.send.encrypt(&mut buf);
        self.stream.write_all(&buf).unwrap();
    }

    fn write_message(&mut self, command: u8, body: &[u8]) {
        let len = body.len() as u16;
        let mut buf = vec![0, command, (len >> 8) as u8, len as u8];
        buf.extend_from_slice(body);
        self.write(&buf);
    }

    fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).unwrap();
        self.recv.decrypt(&mut header);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).unwrap();
        self.recv.decrypt(&mut body);
        (header[1], body)
    }

    fn wait_for_close(&mut self) {
        let mut rest = Vec::new();
        let _ = self.stream.read_to_end(&mut rest);
    }
}

fn advert(id: u32, caid: u16, hop: u8, provider: u32) -> Vec<u8> {
    let mut body = vec![0u8; 21];
    body[..4].copy_from_slice(&id.to_be_bytes());
    body[8..10].copy_from_slice(&caid.to_be_bytes());
    body[10] = hop;
    body[20] = 1;
    body.extend_from_slice(&provider.to_be_bytes()[1..]);
    body.extend_from_slice(&[0; 4]);
    body
}

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn config() -> ClientConfig {
    ClientConfig::new("user", "pass")
        .with_node_id(NODE)
        .with_read_timeout(Duration::from_secs(5))
}

#[test]
fn card_advertisement_to_control_word() {
    let (listener, port) = listener();

    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let user = peer.read_login(b"pass");
        assert_eq!(&user[..5], b"user\0");

        let mut ack = [0u8; 20];
        ack[..5].copy_from_slice(b"CCcam");
        peer.write(&ack);

        let (command, body) = peer.read_message();
        assert_eq!(command, 0x00);
        assert_eq!(&body[20..28], &NODE);

        // A relayed card first, then the directly attached one.
        peer.write_message(0x07, &advert(0x0BADF00D, 0x1234, 1, 0x000A0B));
        peer.write_message(0x07, &advert(CARD, 0x1234, 0, 0x000A0B));

        let (command, body) = peer.read_message();
        assert_eq!(command, 0x01);
        assert_eq!(&body[..2], &[0x12, 0x34]);
        assert_eq!(&body[6..10], &CARD.to_be_bytes());
        assert_eq!(&body[10..12], &[0x01, 0x01]);
        assert_eq!(&body[13..], &[0x80, 0x30, 0x01]);

        let raw: [u8; 16] = core::array::from_fn(|i| i as u8);
        peer.write_message(0x01, &raw);
        let mut decoded = raw;
        decode_cw(&mut decoded, &NODE, CARD);
        peer.send.encrypt(&mut decoded);
    });

    let mut session = Session::open("127.0.0.1", port, config()).unwrap();
    assert_eq!(session.receive().unwrap(), Event::Ignored);
    assert_eq!(session.receive().unwrap(), Event::Ignored);
    assert_eq!(session.cards().len(), 2);

    let request = EcmRequest {
        caid: 0x1234,
        provider_id: 0x000A0B,
        service_id: 0x0101,
        pid: 0x0100,
        index: 42,
        payload: vec![0x80, 0x30, 0x01],
    };
    session.send_request(&request).unwrap();
    assert_eq!(session.selected_card(), Some(CARD));

    let events: Vec<Event> = std::iter::from_fn(|| match session.receive() {
        Ok(Event::PeerClosed) | Err(_) => None,
        Ok(event) => Some(event),
    })
    .collect();

    assert_eq!(
        events,
        vec![Event::ControlWord {
            index: 42,
            cw: ControlWord(hex!("4c5f3151312620302e8e1b901fe60ef0")),
        }]
    );

    server.join().unwrap();
    session.close();
}

#[test]
fn wrong_ack_fails_login() {
    let (listener, port) = listener();

    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        peer.read_login(b"pass");
        let mut ack = [0u8; 20];
        ack[..5].copy_from_slice(b"CCcaX");
        peer.write(&ack);
        peer.wait_for_close();
    });

    let err = Session::open("127.0.0.1", port, config()).err();
    assert_eq!(err, Some(RelayError::AuthRejected));
    server.join().unwrap();
}

#[test]
fn refused_connection() {
    let (listener, port) = listener();
    drop(listener);
    let err = Session::open("127.0.0.1", port, config()).err();
    assert_eq!(err, Some(RelayError::ConnectRefused));
}
