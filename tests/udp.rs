use std::sync::{Arc, Mutex};
use std::time::Duration;

use deft::{UdpConn, UdpServer};

mod util;

use util::{init, wait_for, GroupRunner, LoopRunner};

#[test]
fn datagram_echo() {
    let server_runner = GroupRunner::spawn(1);
    let server = UdpServer::bind(server_runner.group(), "127.0.0.1", 0, false).unwrap();
    server.on_msg(|server, buf, peer| {
        let _ = server.send_to(buf.data(), peer);
    });
    let port = server.local_addr().port();
    assert_ne!(port, 0);

    init();
    let client_loop = deft::EventLoop::new().unwrap();
    let client = UdpConn::connect(&client_loop, "127.0.0.1", port).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        client.on_msg(move |_conn, buf| {
            received.lock().unwrap().push(buf.data().to_vec());
        });
    }
    let _client_runner = LoopRunner::from_loop(client_loop);

    client.send(b"dgram one").unwrap();
    client.send(b"dgram two").unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        received.lock().unwrap().len() == 2
    }));
    let received = received.lock().unwrap();
    assert_eq!(received[0], b"dgram one");
    assert_eq!(received[1], b"dgram two");
}

#[test]
fn datagrams_are_frames() {
    let server_runner = GroupRunner::spawn(1);
    let server = UdpServer::bind(server_runner.group(), "127.0.0.1", 0, false).unwrap();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    {
        let sizes = Arc::clone(&sizes);
        server.on_msg(move |_server, buf, _peer| {
            sizes.lock().unwrap().push(buf.len());
        });
    }
    let port = server.local_addr().port();

    init();
    let client_loop = deft::EventLoop::new().unwrap();
    let client = UdpConn::connect(&client_loop, "127.0.0.1", port).unwrap();
    let _client_runner = LoopRunner::from_loop(client_loop);

    // Two sends never coalesce into one delivery.
    client.send(&[b'x'; 10]).unwrap();
    client.send(&[b'y'; 20]).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        sizes.lock().unwrap().len() == 2
    }));
    assert_eq!(*sizes.lock().unwrap(), vec![10, 20]);
}
