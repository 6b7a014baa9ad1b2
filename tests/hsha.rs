use std::sync::{Arc, Mutex};
use std::time::Duration;

use deft::{EventLoop, HshaServer, LengthCodec, TcpConn, UdpConn, UdpHshaServer};

mod util;

use util::{init, wait_for, GroupRunner, LoopRunner};

// Frames are parsed on the loop, the handler runs on the pool, and the
// response comes back through the loop.
#[test]
fn tcp_request_response() {
    let server_runner = GroupRunner::spawn(1);
    let hsha = HshaServer::bind(
        server_runner.group(),
        "127.0.0.1",
        0,
        false,
        2,
        LengthCodec::new(),
        |_conn, frame| frame.to_ascii_uppercase(),
    )
    .unwrap();
    let port = hsha.local_addr().port();

    init();
    let client_loop = EventLoop::new().unwrap();
    let client = TcpConn::connect(&client_loop, "127.0.0.1", port, 2_000, "").unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        client.on_msg(LengthCodec::new(), move |_conn, frame| {
            received.lock().unwrap().push(frame.to_vec());
        });
    }
    client.send_msg(b"ping").unwrap();
    let _client_runner = LoopRunner::from_loop(client_loop);

    assert!(wait_for(Duration::from_secs(5), || {
        !received.lock().unwrap().is_empty()
    }));
    assert_eq!(received.lock().unwrap()[0], b"PING");

    client.close();
    hsha.close();
}

#[test]
fn udp_request_response() {
    let server_runner = GroupRunner::spawn(1);
    let hsha = UdpHshaServer::bind(
        server_runner.group(),
        "127.0.0.1",
        0,
        false,
        2,
        |_server, datagram, _peer| {
            let mut reversed = datagram.to_vec();
            reversed.reverse();
            reversed
        },
    )
    .unwrap();
    let port = hsha.local_addr().port();

    init();
    let client_loop = EventLoop::new().unwrap();
    let client = UdpConn::connect(&client_loop, "127.0.0.1", port).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        client.on_msg(move |_conn, buf| {
            received.lock().unwrap().push(buf.data().to_vec());
        });
    }
    let _client_runner = LoopRunner::from_loop(client_loop);

    client.send(b"abc").unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        !received.lock().unwrap().is_empty()
    }));
    assert_eq!(received.lock().unwrap()[0], b"cba");

    hsha.close();
}
