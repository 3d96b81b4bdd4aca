//! BLE client for the Serial Port Service with credit-based flow control.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use uuid::Uuid;

/// Serial Port Service UUIDs
pub const SPS_SERVICE_UUID: Uuid = Uuid::from_u128(0x2456e1b9_26e2_8f83_e744_f34f01e9d701);
const SPS_MODE_UUID: Uuid = Uuid::from_u128(0x2456e1b9_26e2_8f83_e744_f34f01e9d702);
const SPS_FIFO_UUID: Uuid = Uuid::from_u128(0x2456e1b9_26e2_8f83_e744_f34f01e9d703);
const SPS_CREDITS_UUID: Uuid = Uuid::from_u128(0x2456e1b9_26e2_8f83_e744_f34f01e9d704);

/// Frames the client lets the device send before it returns credits
const RX_CREDITS: u8 = 16;

/// Payload of one fifo write at the default ATT MTU
pub const FRAME_SIZE: usize = 20;

/// Session state shared with the notification handler
#[derive(Default)]
struct Session {
    /// Received bytes not yet read
    rx: Vec<u8>,
    /// Frames the device may still receive from us
    tx_credits: u32,
    /// Frames received since credits were last returned
    rx_frames: u8,
    /// Total credits granted by the device
    granted: u32,
}

/// BLE client for the serial port service.
pub struct SpsClient {
    peripheral: Peripheral,
    mode_char: Characteristic,
    fifo_char: Characteristic,
    credits_char: Characteristic,
    session: Arc<Mutex<Session>>,
    changed: Arc<Notify>,
}

impl SpsClient {
    /// Scan for a device by name, connect and open the credit session.
    pub async fn connect_by_name(name: &str, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = Self::find_device_by_name(&adapter, name, scan_timeout).await?;
        adapter.stop_scan().await?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid, what: &str| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| anyhow!("SPS {} characteristic not found", what))
        };
        let mode_char = find(SPS_MODE_UUID, "mode")?;
        let fifo_char = find(SPS_FIFO_UUID, "fifo")?;
        let credits_char = find(SPS_CREDITS_UUID, "credits")?;

        let session = Arc::new(Mutex::new(Session::default()));
        let changed = Arc::new(Notify::new());

        // Spawn notification handler before the session opens so no grant is missed
        let session_clone = session.clone();
        let changed_clone = changed.clone();
        let mut stream = peripheral.notifications().await?;
        tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                let mut session = session_clone.lock().await;
                if data.uuid == SPS_FIFO_UUID {
                    session.rx.extend_from_slice(&data.value);
                    session.rx_frames = session.rx_frames.saturating_add(1);
                } else if data.uuid == SPS_CREDITS_UUID {
                    if let Some(&credits) = data.value.first() {
                        session.tx_credits += credits as u32;
                        session.granted += credits as u32;
                    }
                }
                drop(session);
                changed_clone.notify_waiters();
            }
        });

        // The device opens the session once the credits CCC follows the fifo CCC
        peripheral.subscribe(&fifo_char).await?;
        peripheral.subscribe(&credits_char).await?;

        let client = Self {
            peripheral,
            mode_char,
            fifo_char,
            credits_char,
            session,
            changed,
        };
        client.grant_credits(RX_CREDITS).await?;

        Ok(client)
    }

    /// Find a device by name within the scan timeout.
    async fn find_device_by_name(adapter: &Adapter, name: &str, scan_timeout: Duration) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            let peripherals = adapter.peripherals().await?;

            for peripheral in peripherals {
                if let Some(props) = peripheral.properties().await? {
                    if props.local_name.as_deref() == Some(name) {
                        return Ok(peripheral);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("Device '{}' not found within timeout", name))
    }

    /// Let the device send `credits` more frames.
    pub async fn grant_credits(&self, credits: u8) -> Result<()> {
        self.peripheral
            .write(&self.credits_char, &[credits], WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Credits the device has granted since connecting.
    pub async fn granted_credits(&self) -> u32 {
        self.session.lock().await.granted
    }

    /// Wait until the device has granted at least `credits` in total.
    pub async fn wait_for_grant(&self, credits: u32, wait: Duration) -> Result<()> {
        timeout(wait, async {
            loop {
                let notified = self.changed.notified();
                if self.session.lock().await.granted >= credits {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("Timeout waiting for credits"))
    }

    /// Read the reserved mode byte.
    pub async fn read_mode(&self) -> Result<u8> {
        let value = self.peripheral.read(&self.mode_char).await?;
        value
            .first()
            .copied()
            .ok_or_else(|| anyhow!("Empty mode value"))
    }

    /// Send `data` as fifo frames, waiting for credits between frames.
    pub async fn send(&self, data: &[u8], wait: Duration) -> Result<()> {
        for chunk in data.chunks(FRAME_SIZE) {
            self.take_tx_credit(wait).await?;
            self.peripheral
                .write(&self.fifo_char, chunk, WriteType::WithoutResponse)
                .await?;
        }
        Ok(())
    }

    async fn take_tx_credit(&self, wait: Duration) -> Result<()> {
        timeout(wait, async {
            loop {
                let notified = self.changed.notified();
                {
                    let mut session = self.session.lock().await;
                    if session.tx_credits > 0 {
                        session.tx_credits -= 1;
                        return;
                    }
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("Timeout waiting for a transmit credit"))
    }

    /// Read exactly `len` bytes, returning credits as frames are consumed.
    pub async fn read_exact(&self, len: usize, wait: Duration) -> Result<Vec<u8>> {
        let result = timeout(wait, async {
            loop {
                let notified = self.changed.notified();
                self.return_credits().await?;
                {
                    let mut session = self.session.lock().await;
                    if session.rx.len() >= len {
                        return Ok::<_, anyhow::Error>(session.rx.drain(..len).collect());
                    }
                }
                notified.await;
            }
        })
        .await;

        match result {
            Ok(data) => data,
            Err(_) => {
                let have = self.session.lock().await.rx.len();
                Err(anyhow!("Timeout waiting for {} bytes (have {})", len, have))
            }
        }
    }

    /// Wait `quiet` and return whatever arrived.
    pub async fn read_available(&self, quiet: Duration) -> Result<Vec<u8>> {
        tokio::time::sleep(quiet).await;
        self.return_credits().await?;
        let mut session = self.session.lock().await;
        Ok(std::mem::take(&mut session.rx))
    }

    async fn return_credits(&self) -> Result<()> {
        let frames = {
            let mut session = self.session.lock().await;
            std::mem::take(&mut session.rx_frames)
        };
        if frames > 0 {
            self.grant_credits(frames).await?;
        }
        Ok(())
    }

    /// Drop anything received so far.
    pub async fn clear_buffer(&self) -> Result<()> {
        self.read_available(Duration::from_millis(0)).await.map(|_| ())
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.unsubscribe(&self.credits_char).await?;
        self.peripheral.unsubscribe(&self.fifo_char).await?;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
