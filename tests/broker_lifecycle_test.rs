// Drives a full `Broker::run()` loop: intake over a real Unix socket,
// delivery to a loopback TCP peer, and a clean shutdown triggered by a
// real process signal.
//
// Run with: cargo test --test broker_lifecycle_test -- --test-threads=1
// (this test raises a real SIGTERM against the test process; running it
// alongside another test in the same binary that also registers signal
// handlers could observe the same signal).

use gelf_broker::config::Config;
use gelf_broker::upstream::Upstream;
use gelf_broker::{Broker, Listener, SignalListener};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[tokio::test]
async fn run_delivers_an_intake_record_and_unlinks_the_socket_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("intake.sock");

    let graylog = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = graylog.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = graylog.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..read]);
        }
        let _ = tx.send(buf);
    });

    let config = Config {
        socket: socket_path.clone(),
        perms: None,
        graylog: format!("127.0.0.1:{port}"),
        ssl: None,
        buffer: dir.path().join("broker.buffer"),
        status: dir.path().join("broker.status"),
        pidfile: dir.path().join("broker.pid"),
        queue_capacity: None,
        queue_drop_policy: gelf_broker::queue::DropPolicy::DropOldest,
    };

    let listener = Listener::bind(&config.socket, config.perms).unwrap();
    let hostport = config.graylog_hostport().unwrap();
    let upstream = Upstream::new(hostport, None);
    let broker = Broker::new(config, dir.path().join("broker.yml"), listener, upstream, false);

    let signals = SignalListener::register().unwrap();
    let run_handle = tokio::spawn(broker.run(signals));

    // Let the control loop connect upstream (the reconnect timers fire on
    // their first tick), then deliver one record over the real intake
    // socket.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let sender = std::os::unix::net::UnixDatagram::unbound().unwrap();
    sender.connect(&socket_path).unwrap();
    let datagram = gelf_broker::envelope::encode_intake(b"hello");
    sender.send(&datagram).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    unsafe {
        libc::raise(libc::SIGTERM);
    }

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), run_handle).await;
    assert!(result.is_ok(), "broker run() did not exit after SIGTERM");
    result.unwrap().unwrap();

    assert!(
        !socket_path.exists(),
        "listener socket file should be unlinked on shutdown"
    );

    let received = rx.await.unwrap();
    let frames: Vec<&[u8]> = received.split(|&b| b == 0).filter(|f| !f.is_empty()).collect();
    assert!(
        frames.iter().any(|f| *f == b"hello"),
        "expected the forwarded record among delivered frames: {frames:?}"
    );
}
