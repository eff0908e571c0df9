//! # fringe-client
//!
//! Library-level client for the fringe backend: a typed method per
//! command on the TCP control port, plus a UDP listener for correlation
//! datagrams. Negative status bytes come back as named errors.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use fringe_proto::{
    read_frame, write_frame, Command, CorrelationPacket, FrameError, PacketError,
    STATUS_BAD_LENGTH, STATUS_OK,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("antennas not in the system: {0:?}")]
    UnknownAntennas(Vec<u8>),
    #[error("argument length rejected by the server")]
    BadArguments,
    #[error("request rejected (already in the requested state, or nothing to return)")]
    Rejected,
    #[error("server answered status {0}")]
    Status(i8),
    #[error("response too short for the expected payload")]
    ShortResponse,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client for the TCP command port. One connection per request, the way
/// the control protocol expects low-rate operator traffic.
#[derive(Debug, Clone)]
pub struct InterfaceClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl InterfaceClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Send one command payload and return (status, data).
    async fn request(&self, payload: &[u8]) -> ClientResult<(i8, Bytes)> {
        let fut = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            write_frame(&mut stream, payload).await?;
            let response = read_frame(&mut stream).await?;
            Ok::<_, ClientError>(response)
        };
        let response = timeout(self.timeout, fut)
            .await
            .map_err(|_| ClientError::Timeout)??;
        if response.is_empty() {
            return Err(ClientError::ShortResponse);
        }
        let status = response[0] as i8;
        debug!(cmd = payload.first().copied(), status, "command round trip");
        Ok((status, response.slice(1..)))
    }

    /// Run a command whose failure modes are the shared status codes.
    async fn simple(&self, payload: &[u8]) -> ClientResult<Bytes> {
        let (status, data) = self.request(payload).await?;
        match status {
            STATUS_OK => Ok(data),
            STATUS_BAD_LENGTH => Err(ClientError::BadArguments),
            s if s == fringe_proto::STATUS_INVALID => Err(ClientError::Rejected),
            s => Err(ClientError::Status(s)),
        }
    }

    fn address_args(cmd: Command, ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut payload = Vec::with_capacity(7);
        payload.push(cmd.code());
        payload.extend_from_slice(&ip.octets());
        payload.extend_from_slice(&port.to_be_bytes());
        payload
    }

    pub async fn subscribe(&self, ip: Ipv4Addr, port: u16) -> ClientResult<()> {
        self.simple(&Self::address_args(Command::Subscribe, ip, port)).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, ip: Ipv4Addr, port: u16) -> ClientResult<()> {
        self.simple(&Self::address_args(Command::Unsubscribe, ip, port)).await?;
        Ok(())
    }

    pub async fn start_correlator(&self) -> ClientResult<()> {
        self.simple(&[Command::StartCorrelator.code()]).await?;
        Ok(())
    }

    pub async fn stop_correlator(&self) -> ClientResult<()> {
        self.simple(&[Command::StopCorrelator.code()]).await?;
        Ok(())
    }

    pub async fn get_integration_time(&self) -> ClientResult<f32> {
        let data = self.simple(&[Command::GetIntegrationTime.code()]).await?;
        if data.len() < 4 {
            return Err(ClientError::ShortResponse);
        }
        Ok(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub async fn set_integration_time(&self, seconds: f32) -> ClientResult<()> {
        let mut payload = vec![Command::SetIntegrationTime.code()];
        payload.extend_from_slice(&seconds.to_be_bytes());
        self.simple(&payload).await?;
        Ok(())
    }

    pub async fn get_reference(&self) -> ClientResult<u8> {
        let data = self.simple(&[Command::GetReference.code()]).await?;
        data.first().copied().ok_or(ClientError::ShortResponse)
    }

    pub async fn reset_xaui(&self, level: u8) -> ClientResult<()> {
        self.simple(&[Command::ResetXaui.code(), level]).await?;
        Ok(())
    }

    pub async fn arm_sync(&self) -> ClientResult<()> {
        self.simple(&[Command::ArmSync.code()]).await?;
        Ok(())
    }

    pub async fn noise_mode(&self, on: bool) -> ClientResult<()> {
        self.simple(&[Command::NoiseMode.code(), on as u8]).await?;
        Ok(())
    }

    pub async fn delay_tracker(&self, on: bool) -> ClientResult<()> {
        self.simple(&[Command::DelayTracker.code(), on as u8]).await?;
        Ok(())
    }

    pub async fn setup_fstopping(&self, rate_ghz: f32) -> ClientResult<()> {
        let mut payload = vec![Command::SetupFstopping.code()];
        payload.extend_from_slice(&rate_ghz.to_be_bytes());
        self.simple(&payload).await?;
        Ok(())
    }

    pub async fn start_fstopping(&self) -> ClientResult<()> {
        self.simple(&[Command::StartFstopping.code()]).await?;
        Ok(())
    }

    pub async fn stop_fstopping(&self) -> ClientResult<()> {
        self.simple(&[Command::StopFstopping.code()]).await?;
        Ok(())
    }

    pub async fn load_walsh_table(&self) -> ClientResult<()> {
        self.simple(&[Command::LoadWalshTable.code()]).await?;
        Ok(())
    }

    pub async fn clear_walsh_table(&self) -> ClientResult<()> {
        self.simple(&[Command::ClearWalshTable.code()]).await?;
        Ok(())
    }

    /// Run a shell line on every board whose name matches the prefix in
    /// the line's first word; returns the concatenated board output.
    pub async fn board_shell(&self, line: &str) -> ClientResult<String> {
        let mut payload = vec![Command::BoardShell.code()];
        payload.extend_from_slice(line.as_bytes());
        let data = self.simple(&payload).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Forward a log line into the server's logger.
    pub async fn operations_log(&self, level: u8, name: &str, message: &str) -> ClientResult<()> {
        let mut payload = vec![Command::OperationsLog.code(), level];
        payload.extend_from_slice(name.as_bytes());
        payload.push(b'\r');
        payload.extend_from_slice(message.as_bytes());
        self.simple(&payload).await?;
        Ok(())
    }

    pub async fn get_correlation(&self) -> ClientResult<CorrelationPacket> {
        let data = self.simple(&[Command::GetCorrelation.code()]).await?;
        Ok(CorrelationPacket::from_bytes(&data)?)
    }

    pub async fn shutdown(&self) -> ClientResult<()> {
        self.simple(&[Command::Shutdown.code()]).await?;
        Ok(())
    }

    // Per-antenna value families. An empty antenna list asks for every
    // antenna in the system.

    async fn get_family(&self, cmd: Command, antennas: &[u8]) -> ClientResult<Bytes> {
        let mut payload = BytesMut::with_capacity(1 + antennas.len());
        payload.put_u8(cmd.code());
        payload.put_slice(antennas);
        self.family_request(payload.freeze()).await
    }

    fn unpack_floats(data: &Bytes) -> ClientResult<Vec<f32>> {
        if data.len() % 4 != 0 {
            return Err(ClientError::ShortResponse);
        }
        let mut buf = &data[..];
        let mut out = Vec::with_capacity(data.len() / 4);
        while buf.has_remaining() {
            out.push(buf.get_f32());
        }
        Ok(out)
    }

    async fn get_floats(&self, cmd: Command, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        let data = self.get_family(cmd, antennas).await?;
        Self::unpack_floats(&data)
    }

    async fn set_floats(&self, cmd: Command, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        let mut payload = BytesMut::with_capacity(1 + pairs.len() * 5);
        payload.put_u8(cmd.code());
        for &(antenna, value) in pairs {
            payload.put_u8(antenna);
            payload.put_f32(value);
        }
        let data = self.family_request(payload.freeze()).await?;
        Self::unpack_floats(&data)
    }

    async fn get_bytes(&self, cmd: Command, antennas: &[u8]) -> ClientResult<Vec<u8>> {
        let data = self.get_family(cmd, antennas).await?;
        Ok(data.to_vec())
    }

    async fn set_bytes(&self, cmd: Command, pairs: &[(u8, u8)]) -> ClientResult<Vec<u8>> {
        let mut payload = BytesMut::with_capacity(1 + pairs.len() * 2);
        payload.put_u8(cmd.code());
        for &(antenna, value) in pairs {
            payload.put_u8(antenna);
            payload.put_u8(value);
        }
        let data = self.family_request(payload.freeze()).await?;
        Ok(data.to_vec())
    }

    /// Shared status handling for the per-antenna value families: a `-1`
    /// with trailing bytes carries the list of offending antennas.
    async fn family_request(&self, payload: Bytes) -> ClientResult<Bytes> {
        let (status, data) = self.request(&payload).await?;
        match status {
            STATUS_OK => Ok(data),
            STATUS_BAD_LENGTH => Err(ClientError::BadArguments),
            s if s == fringe_proto::STATUS_INVALID && !data.is_empty() => {
                Err(ClientError::UnknownAntennas(data.to_vec()))
            }
            s if s == fringe_proto::STATUS_INVALID => Err(ClientError::Rejected),
            s => Err(ClientError::Status(s)),
        }
    }

    pub async fn get_mapping(&self, antennas: &[u8]) -> ClientResult<Vec<u8>> {
        self.get_bytes(Command::GetMapping, antennas).await
    }

    pub async fn set_mapping(&self, pairs: &[(u8, u8)]) -> ClientResult<Vec<u8>> {
        self.set_bytes(Command::SetMapping, pairs).await
    }

    pub async fn get_delays(&self, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        self.get_floats(Command::GetDelays, antennas).await
    }

    pub async fn set_delays(&self, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        self.set_floats(Command::SetDelays, pairs).await
    }

    pub async fn get_phases(&self, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        self.get_floats(Command::GetPhases, antennas).await
    }

    pub async fn set_phases(&self, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        self.set_floats(Command::SetPhases, pairs).await
    }

    pub async fn get_gains(&self, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        self.get_floats(Command::GetGains, antennas).await
    }

    pub async fn set_gains(&self, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        self.set_floats(Command::SetGains, pairs).await
    }

    pub async fn get_thresholds(&self, antennas: &[u8]) -> ClientResult<Vec<u8>> {
        self.get_bytes(Command::GetThresholds, antennas).await
    }

    pub async fn set_thresholds(&self, pairs: &[(u8, u8)]) -> ClientResult<Vec<u8>> {
        self.set_bytes(Command::SetThresholds, pairs).await
    }

    pub async fn get_phase_offsets(&self, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        self.get_floats(Command::GetPhaseOffsets, antennas).await
    }

    pub async fn set_phase_offsets(&self, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        self.set_floats(Command::SetPhaseOffsets, pairs).await
    }

    pub async fn get_delay_offsets(&self, antennas: &[u8]) -> ClientResult<Vec<f32>> {
        self.get_floats(Command::GetDelayOffsets, antennas).await
    }

    pub async fn set_delay_offsets(&self, pairs: &[(u8, f32)]) -> ClientResult<Vec<f32>> {
        self.set_floats(Command::SetDelayOffsets, pairs).await
    }

    pub async fn get_dbe_gains(&self) -> ClientResult<[u32; 16]> {
        let data = self.simple(&[Command::GetDbeGains.code()]).await?;
        if data.len() < 64 {
            return Err(ClientError::ShortResponse);
        }
        let mut buf = &data[..];
        let mut gains = [0u32; 16];
        for slot in gains.iter_mut() {
            *slot = buf.get_u32();
        }
        Ok(gains)
    }

    pub async fn set_dbe_gains(&self, gains: &[u32; 16]) -> ClientResult<[u32; 16]> {
        let mut payload = BytesMut::with_capacity(65);
        payload.put_u8(Command::SetDbeGains.code());
        for &g in gains {
            payload.put_u32(g);
        }
        let data = self.family_request(payload.freeze()).await?;
        if data.len() < 64 {
            return Err(ClientError::ShortResponse);
        }
        let mut buf = &data[..];
        let mut out = [0u32; 16];
        for slot in out.iter_mut() {
            *slot = buf.get_u32();
        }
        Ok(out)
    }
}

/// UDP listener for the correlation fan-out. Bind it, subscribe its
/// local address on the server, then pull packets.
pub struct CorrelationListener {
    socket: UdpSocket,
}

impl CorrelationListener {
    pub async fn bind(addr: SocketAddr) -> ClientResult<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> ClientResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn recv(&self) -> ClientResult<CorrelationPacket> {
        let mut buf = vec![0u8; 65536];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        Ok(CorrelationPacket::from_bytes(&buf[..len])?)
    }

    pub async fn recv_timeout(&self, wait: Duration) -> ClientResult<CorrelationPacket> {
        timeout(wait, self.recv()).await.map_err(|_| ClientError::Timeout)?
    }
}
