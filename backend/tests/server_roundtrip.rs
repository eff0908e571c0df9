//! End-to-end tests: boot the backend on the simulated block and drive
//! it through the client library and raw frames.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fringe_backend::config::{parse_baselines, BackendConfig, Block};
use fringe_backend::server::{serve, Backend};
use fringe_client::{ClientError, CorrelationListener, InterfaceClient};
use fringe_proto::{read_frame, write_frame, Command};

const ANTENNAS: [u8; 8] = [6, 1, 2, 3, 4, 5, 7, 8];

async fn spawn_server(pattern: &str) -> (SocketAddr, Arc<Backend>, JoinHandle<()>) {
    let config = BackendConfig::for_block(Block::Sim);
    let baselines = parse_baselines(pattern, &ANTENNAS);
    let backend = Backend::build(Block::Sim, config, ANTENNAS.to_vec(), 6, baselines);
    backend.setup().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = backend.clone();
    let task = tokio::spawn(async move {
        serve(serving, listener).await.unwrap();
    });
    (addr, backend, task)
}

async fn raw_request(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, payload).await.unwrap();
    read_frame(&mut stream).await.unwrap().to_vec()
}

#[tokio::test]
async fn integration_time_echoes_after_set() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    client.set_integration_time(2.0).await.unwrap();
    let got = client.get_integration_time().await.unwrap();
    assert_eq!(got, 2.0);

    backend.stop_workers().await;
}

#[tokio::test]
async fn gain_set_quantizes_and_reads_back() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let set = client.set_gains(&[(3, 0.501)]).await.unwrap();
    assert_eq!(set, vec![0.5]);
    let got = client.get_gains(&[3]).await.unwrap();
    assert_eq!(got, vec![0.5]);

    backend.stop_workers().await;
}

#[tokio::test]
async fn unknown_antenna_is_named_in_the_error() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    match client.get_phases(&[99]).await {
        Err(ClientError::UnknownAntennas(list)) => assert_eq!(list, vec![99]),
        other => panic!("expected the unknown-antenna error, got {other:?}"),
    }

    backend.stop_workers().await;
}

#[tokio::test]
async fn empty_antenna_list_answers_for_every_antenna() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let mapping = client.get_mapping(&[]).await.unwrap();
    assert_eq!(mapping, vec![0, 1, 2, 3, 4, 5, 6, 7]);

    backend.stop_workers().await;
}

#[tokio::test]
async fn subscribe_edge_statuses() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);
    let ip = Ipv4Addr::new(127, 0, 0, 1);

    // wrong argument length -> -2
    let response = raw_request(addr, &[Command::Subscribe.code(), 127, 0, 0, 1, 0]).await;
    assert_eq!(response[0] as i8, -2);

    client.subscribe(ip, 34567).await.unwrap();
    match client.subscribe(ip, 34567).await {
        Err(ClientError::Rejected) => {}
        other => panic!("double subscribe should be rejected, got {other:?}"),
    }
    client.unsubscribe(ip, 34567).await.unwrap();
    match client.unsubscribe(ip, 34567).await {
        Err(ClientError::Rejected) => {}
        other => panic!("absent unsubscribe should be rejected, got {other:?}"),
    }

    backend.stop_workers().await;
}

#[tokio::test]
async fn correlator_lifecycle_rejects_duplicates() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    client.start_correlator().await.unwrap();
    assert!(backend.provider.lock().await.is_running());
    assert!(matches!(client.start_correlator().await, Err(ClientError::Rejected)));
    client.stop_correlator().await.unwrap();
    assert!(!backend.provider.lock().await.is_running());
    assert!(matches!(client.stop_correlator().await, Err(ClientError::Rejected)));

    backend.stop_workers().await;
}

#[tokio::test]
async fn subscriber_receives_the_fan_out() {
    let (addr, backend, _task) = spawn_server("1-6").await;
    let client = InterfaceClient::new(addr);

    let listener = CorrelationListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let udp_port = listener.local_addr().unwrap().port();
    client.subscribe(Ipv4Addr::new(127, 0, 0, 1), udp_port).await.unwrap();
    client.start_correlator().await.unwrap();

    // One simulated integration is a second; allow a generous margin.
    let packet = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((packet.left, packet.right), (1, 6));
    assert_eq!(packet.total, 1);
    assert!(packet.current < packet.total);
    assert_eq!(packet.lags.len(), 16);
    assert_eq!(packet.visibility.len(), 15);

    // The same datagram is retrievable over TCP.
    let over_tcp = client.get_correlation().await.unwrap();
    assert_eq!(over_tcp.total, 1);

    client.stop_correlator().await.unwrap();
    backend.stop_workers().await;
}

#[tokio::test]
async fn unknown_command_answers_invalid() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let response = raw_request(addr, &[4]).await;
    assert_eq!(response, vec![0xff]); // -1
    backend.stop_workers().await;
}

#[tokio::test]
async fn reference_and_fstopping_commands() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    assert_eq!(client.get_reference().await.unwrap(), 6);
    client.setup_fstopping(-0.128).await.unwrap();

    client.start_fstopping().await.unwrap();
    assert!(matches!(client.start_fstopping().await, Err(ClientError::Rejected)));
    client.stop_fstopping().await.unwrap();
    assert!(matches!(client.stop_fstopping().await, Err(ClientError::Rejected)));

    backend.stop_workers().await;
}

#[tokio::test]
async fn delay_tracker_toggles() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    client.delay_tracker(true).await.unwrap();
    assert!(matches!(client.delay_tracker(true).await, Err(ClientError::Rejected)));
    client.delay_tracker(false).await.unwrap();
    assert!(matches!(client.delay_tracker(false).await, Err(ClientError::Rejected)));

    backend.stop_workers().await;
}

#[tokio::test]
async fn dbe_gains_round_trip() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let gains: [u32; 16] = std::array::from_fn(|i| (i as u32 + 1) * 100);
    let written = client.set_dbe_gains(&gains).await.unwrap();
    assert_eq!(written, gains);
    let read = client.get_dbe_gains().await.unwrap();
    assert_eq!(read, gains);

    backend.stop_workers().await;
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let (addr, backend, task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    client.start_correlator().await.unwrap();
    client.delay_tracker(true).await.unwrap();
    client.start_fstopping().await.unwrap();
    client.shutdown().await.unwrap();

    // The serve task drains its workers and returns.
    timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert!(!backend.state.lock().await.started);
    assert!(backend.delay_tracker.lock().await.is_none());
    assert!(backend.phase_tracker.lock().await.is_none());

    // The listener is gone; fresh commands fail.
    let client = InterfaceClient::with_timeout(addr, Duration::from_millis(500));
    assert!(client.get_reference().await.is_err());
}

#[tokio::test]
async fn mapping_set_reads_back() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let written = client.set_mapping(&[(1, 3), (3, 1)]).await.unwrap();
    assert_eq!(written, vec![3, 1]);
    let read = client.get_mapping(&[1, 3]).await.unwrap();
    assert_eq!(read, vec![3, 1]);

    backend.stop_workers().await;
}

#[tokio::test]
async fn hardware_commands_succeed_on_the_sim_block() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    client.reset_xaui(6).await.unwrap();
    client.arm_sync().await.unwrap();
    client.noise_mode(true).await.unwrap();
    client.noise_mode(false).await.unwrap();
    client.load_walsh_table().await.unwrap();
    client.clear_walsh_table().await.unwrap();
    client.operations_log(20, "scheduler", "observation started").await.unwrap();

    backend.stop_workers().await;
}

#[tokio::test]
async fn offsets_write_through_the_input_boards() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let written = client.set_delay_offsets(&[(2, 1.25)]).await.unwrap();
    assert_eq!(written, vec![1.25]);
    assert_eq!(client.get_delay_offsets(&[2]).await.unwrap(), vec![1.25]);

    let written = client.set_phase_offsets(&[(5, -12.5)]).await.unwrap();
    assert_eq!(written, vec![-12.5]);
    assert_eq!(client.get_phase_offsets(&[5]).await.unwrap(), vec![-12.5]);

    backend.stop_workers().await;
}

#[tokio::test]
async fn board_shell_addresses_by_prefix() {
    let (addr, backend, _task) = spawn_server("6-*").await;
    let client = InterfaceClient::new(addr);

    let reply = client.board_shell("ipa arm1pps").await.unwrap();
    assert!(reply.contains("### ipa0 arm1pps"));
    assert!(reply.contains("### ipa1 arm1pps"));
    assert!(!reply.contains("### dbe"));

    backend.stop_workers().await;
}
