use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use twc_protocol::{decode, encode, hex_dump, Command, FrameAccumulator};

const READ_CHUNK: usize = 64;

/// Options for the RS-485 adapter and the per-tick read budget.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// How long a single read waits for bytes before the tick moves on.
    pub read_timeout_ms: u64,
    /// Upper bound on bytes consumed in one `receive` call.
    pub max_read_bytes: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9_600,
            read_timeout_ms: 10,
            max_read_bytes: 512,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed by peer")]
    Closed,
}

/// Counters kept per link, mirrored into the metrics registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub bytes_discarded: u64,
}

/// Open the serial device as 8N1 without flow control.
pub fn open_serial(config: &SerialConfig) -> Result<SerialStream, LinkError> {
    tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|source| LinkError::Open {
            path: config.port.clone(),
            source,
        })
}

/// Frame-level view of a byte stream: writes encoded bodies, reads decoded ones.
#[derive(Debug)]
pub struct FramedLink<S> {
    io: S,
    accumulator: FrameAccumulator,
    read_timeout: Duration,
    max_read_bytes: usize,
    stats: LinkStats,
}

impl<S> FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, config: &SerialConfig) -> Self {
        Self {
            io,
            accumulator: FrameAccumulator::new(),
            read_timeout: Duration::from_millis(config.read_timeout_ms.max(1)),
            max_read_bytes: config.max_read_bytes.max(1),
            stats: LinkStats::default(),
        }
    }

    pub async fn send(&mut self, body: &[u8]) -> Result<(), LinkError> {
        let raw = encode(body);
        trace!(frame = %hex_dump(&raw), "tx");
        self.io.write_all(&raw).await?;
        self.io.flush().await?;
        self.stats.frames_sent += 1;
        metrics::counter!("twc_frames_tx_total").increment(1);
        Ok(())
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<(), LinkError> {
        self.send(&command.body()).await
    }

    /// Read whatever arrives within the read timeout and return the valid
    /// message bodies it completed.
    ///
    /// Frames failing length, escape or checksum checks are dropped here.
    pub async fn receive(&mut self) -> Result<Vec<Vec<u8>>, LinkError> {
        let mut buf = [0u8; READ_CHUNK];
        let mut consumed = 0usize;
        let mut bodies = Vec::new();

        while consumed < self.max_read_bytes {
            let read = match timeout(self.read_timeout, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(LinkError::Closed),
                Ok(Ok(read)) => read,
                Ok(Err(err)) => return Err(LinkError::Io(err)),
                Err(_) => break,
            };
            consumed += read;

            for raw in self.accumulator.extend(&buf[..read]) {
                match decode(&raw) {
                    Ok(body) => {
                        trace!(frame = %hex_dump(&body), "rx");
                        self.stats.frames_received += 1;
                        metrics::counter!("twc_frames_rx_total").increment(1);
                        bodies.push(body);
                    }
                    Err(err) => {
                        debug!(error = %err, frame = %hex_dump(&raw), "discarding frame");
                        self.stats.frames_rejected += 1;
                        metrics::counter!("twc_frames_rejected_total", "reason" => err.reason())
                            .increment(1);
                    }
                }
            }
        }

        let discarded = self.accumulator.take_discarded();
        if discarded > 0 {
            trace!(bytes = discarded, "ignored bytes outside a frame");
            self.stats.bytes_discarded += discarded as u64;
        }

        Ok(bodies)
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}
