use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use intercept::VelocityCommand;
use robot_link::{
    BridgeOptions, ChannelOptions, CommandChannel, HardwareLink, LinkError, RelayServer, SerialBridge,
    SharedBroker, broker, ws,
};
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay() -> (SocketAddr, SharedBroker) {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let broker = server.broker();
    tokio::spawn(server.serve());
    (addr, broker)
}

async fn wait_for_counts(broker: &SharedBroker, controllers: usize, robots: usize) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let counts = {
            let guard = broker::lock(broker);
            (guard.controller_count(), guard.robot_count())
        };
        if counts == (controllers, robots) {
            return;
        }
        assert!(Instant::now() < deadline, "broker counts stuck at {counts:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Blocking client on its own thread; returns every text frame seen before `idle`.
fn spawn_reader(addr: SocketAddr, path: &'static str, idle: Duration) -> thread::JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut socket = ws::connect(&format!("ws://{addr}{path}"), TIMEOUT).unwrap();
        socket.get_ref().set_read_timeout(Some(idle)).unwrap();
        let mut seen = Vec::new();
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => seen.push(text),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        seen
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_commands_fan_out_to_robots_only() {
    let (addr, broker) = start_relay().await;

    let robot_a = spawn_reader(addr, "/ws/robot", Duration::from_millis(1500));
    let robot_b = spawn_reader(addr, "/ws/robot", Duration::from_millis(1500));
    let observer = spawn_reader(addr, "/ws/controller", Duration::from_millis(1500));
    wait_for_counts(&broker, 1, 2).await;

    let sender = tokio::task::spawn_blocking(move || {
        let mut socket = ws::connect(&format!("ws://{addr}/ws/controller"), TIMEOUT).unwrap();
        ws::send_text(&mut socket, "V:0.500,-0.250").unwrap();
        ws::send_text(&mut socket, "ping").unwrap();
        let reply = loop {
            match socket.read().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        ws::close(&mut socket);
        reply
    });
    assert_eq!(sender.await.unwrap(), "pong");

    for robot in [robot_a, robot_b] {
        assert_eq!(robot.join().unwrap(), vec!["V:0.500,-0.250".to_owned()]);
    }
    assert!(observer.join().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_paths_are_refused() {
    let (addr, broker) = start_relay().await;
    let result = tokio::task::spawn_blocking(move || ws::connect(&format!("ws://{addr}/ws/admin"), TIMEOUT))
        .await
        .unwrap();
    assert!(matches!(result, Err(LinkError::Handshake { .. })));
    wait_for_counts(&broker, 0, 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnected_clients_leave_the_registry() {
    let (addr, broker) = start_relay().await;
    let robot = spawn_reader(addr, "/ws/robot", Duration::from_millis(100));
    wait_for_counts(&broker, 0, 1).await;
    robot.join().unwrap();
    wait_for_counts(&broker, 0, 0).await;
}

#[derive(Clone, Default)]
struct RecordingHardware(Arc<Mutex<Vec<String>>>);

impl HardwareLink for RecordingHardware {
    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.0.lock().unwrap().push(line.to_owned());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_travel_from_channel_through_relay_to_hardware() {
    let (addr, broker) = start_relay().await;

    let hardware = RecordingHardware::default();
    let shutdown = Arc::new(AtomicBool::new(false));
    let bridge_thread = {
        let hardware = hardware.clone();
        let shutdown = shutdown.clone();
        let options = BridgeOptions {
            relay_url: format!("ws://{addr}/ws/robot"),
            reconnect_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            ..BridgeOptions::default()
        };
        thread::spawn(move || SerialBridge::new(hardware, options).run(&shutdown))
    };
    wait_for_counts(&broker, 0, 1).await;

    let lines = tokio::task::spawn_blocking(move || {
        let channel = CommandChannel::websocket(
            format!("ws://{addr}/ws/controller"),
            ChannelOptions {
                auto_reconnect: false,
                ..ChannelOptions::default()
            },
        );
        channel.connect().unwrap();
        channel.send(&VelocityCommand::new(0.5, -0.25)).unwrap();
        let deadline = Instant::now() + TIMEOUT;
        while hardware.0.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        channel.send_text("garbage").unwrap();
        channel.disconnect();

        let deadline = Instant::now() + TIMEOUT;
        while hardware.0.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        shutdown.store(true, Ordering::SeqCst);
        bridge_thread.join().unwrap().unwrap();
        hardware.0.lock().unwrap().clone()
    })
    .await
    .unwrap();

    assert_eq!(lines[0], "V:0.500,-0.250");
    assert_eq!(lines[1], "V:0.000,0.000");
    assert!(lines.iter().all(|line| line != "garbage"));
}

/// Relay on its own runtime so that shutting the runtime down drops every connection.
fn start_relay_runtime(addr: &str) -> (tokio::runtime::Runtime, SocketAddr, SharedBroker) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(RelayServer::bind(addr)).unwrap();
    let addr = server.local_addr().unwrap();
    let broker = server.broker();
    runtime.spawn(server.serve());
    (runtime, addr, broker)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn send_as_controller(addr: SocketAddr, line: &str) {
    let mut socket = ws::connect(&format!("ws://{addr}/ws/controller"), TIMEOUT).unwrap();
    ws::send_text(&mut socket, line).unwrap();
    ws::close(&mut socket);
}

#[test]
fn bridge_halts_base_and_resumes_after_relay_restart() {
    let (first, addr, broker) = start_relay_runtime("127.0.0.1:0");

    let hardware = RecordingHardware::default();
    let shutdown = Arc::new(AtomicBool::new(false));
    let bridge_thread = {
        let hardware = hardware.clone();
        let shutdown = shutdown.clone();
        let options = BridgeOptions {
            relay_url: format!("ws://{addr}/ws/robot"),
            reconnect_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
            ..BridgeOptions::default()
        };
        thread::spawn(move || SerialBridge::new(hardware, options).run(&shutdown))
    };
    let lines = |hardware: &RecordingHardware| hardware.0.lock().unwrap().clone();

    assert!(wait_until(|| broker::lock(&broker).robot_count() == 1));
    send_as_controller(addr, "V:0.100,0.200");
    assert!(wait_until(|| lines(&hardware).len() == 1));

    first.shutdown_timeout(Duration::from_millis(200));
    assert!(wait_until(|| lines(&hardware).len() == 2));
    assert_eq!(lines(&hardware)[1], "V:0.000,0.000");

    let (_second, _, broker) = start_relay_runtime(&addr.to_string());
    assert!(wait_until(|| broker::lock(&broker).robot_count() == 1));
    send_as_controller(addr, "V:-0.300,0.000");
    assert!(wait_until(|| lines(&hardware).len() >= 3));

    shutdown.store(true, Ordering::SeqCst);
    bridge_thread.join().unwrap().unwrap();
    let lines = lines(&hardware);
    assert_eq!(&lines[..3], ["V:0.100,0.200", "V:0.000,0.000", "V:-0.300,0.000"]);
}
