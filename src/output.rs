// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::error::Error;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, error, info, span, Level};

use crate::color::{Frame, Rgb};
use crate::engine::Counters;
use crate::playsync::CancelHandle;

/// How long the output worker waits for a frame before re-checking the
/// cancel handle.
const RECV_POLL: Duration = Duration::from_millis(100);

/// One downstream light controller: where to send and which part of the
/// frame it gets.
pub struct Destination {
    addr: SocketAddr,
    /// None sends the whole frame; otherwise the inclusive LED index range,
    /// where an end of -1 means the last LED.
    range: Option<(i64, i64)>,
}

impl Destination {
    pub fn new(
        ip: &str,
        port: u16,
        copy_mode: bool,
        start_led: i64,
        end_led: i64,
    ) -> Result<Destination, Box<dyn Error>> {
        let addr: SocketAddr = format!("{}:{}", ip, port).parse()?;
        Ok(Destination {
            addr,
            range: if copy_mode {
                None
            } else {
                Some((start_led, end_led))
            },
        })
    }

    /// The part of the frame this destination receives, clipped to the strip.
    fn slice<'a>(&self, frame: &'a [Rgb]) -> &'a [Rgb] {
        let Some((start, end)) = self.range else {
            return frame;
        };

        let led_count = frame.len() as i64;
        let end = if end < 0 { led_count - 1 } else { end.min(led_count - 1) };
        let start = start.max(0);
        if start > end {
            return &[];
        }
        &frame[start as usize..=end as usize]
    }
}

/// Serializes LED colors as consecutive RGB bytes in LED order.
pub fn frame_bytes(leds: &[Rgb]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(leds.len() * 3);
    for led in leds {
        bytes.extend_from_slice(&[led.r, led.g, led.b]);
    }
    bytes
}

/// Fans finished frames out to every configured destination as one OSC blob
/// message per destination per frame.
pub struct Output {
    socket: UdpSocket,
    output_address: String,
    destinations: Vec<Destination>,
    counters: Arc<Counters>,
}

impl Output {
    pub fn new(
        output_address: String,
        destinations: Vec<Destination>,
        counters: Arc<Counters>,
    ) -> Result<Output, Box<dyn Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        Ok(Output {
            socket,
            output_address,
            destinations,
            counters,
        })
    }

    /// Sends the frame to every destination. A failure towards one
    /// destination is counted and does not affect the others; there are no
    /// retries within a frame.
    pub fn send_frame(&self, frame: &[Rgb]) {
        for destination in &self.destinations {
            let blob = frame_bytes(destination.slice(frame));
            let packet = OscPacket::Message(OscMessage {
                addr: self.output_address.clone(),
                args: vec![OscType::Blob(blob)],
            });

            match rosc::encoder::encode(&packet) {
                Ok(buf) => {
                    if let Err(e) = self.socket.send_to(&buf, destination.addr) {
                        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            err = e.to_string(),
                            destination = destination.addr.to_string(),
                            "Error sending frame."
                        );
                    }
                }
                Err(e) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    error!(err = e.to_string(), "Error encoding output message.");
                }
            }
        }
    }

    /// Starts the output worker on its own thread, draining the frame
    /// channel until it disconnects or the handle is cancelled.
    pub fn start_thread(
        self,
        receiver: Receiver<Frame>,
        cancel_handle: CancelHandle,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let span = span!(Level::INFO, "output");
            let _enter = span.enter();

            info!(destinations = self.destinations.len(), "Output worker started.");
            loop {
                if cancel_handle.is_cancelled() {
                    info!("Output worker stopped.");
                    return;
                }
                match receiver.recv_timeout(RECV_POLL) {
                    Ok(frame) => self.send_frame(&frame),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("Frame channel closed, output worker stopped.");
                        return;
                    }
                }
            }
        })
    }
}
