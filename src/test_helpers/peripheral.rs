use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dfu::{
    normalize_address, BleTransport, ConnectError, DeviceMode, DfuCharacteristic, DfuError,
    DfuImageType, DfuResult, Notification, TransportFactory, WriteError,
};

/// Misbehaviour the simulated peripheral can be told to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Drop the link right after the `after`-th image packet, `times` times.
    LinkLossAfterPackets { after: usize, times: usize },
    /// Reboot into the bootloader without answering the buttonless command.
    RebootWithoutResponse,
    /// Report a wrong CRC16 in the receipt report.
    CorruptReceiptCrc,
    /// Packet receipt notifications count one byte less than received.
    ShortReceiptCount,
    /// The receipt report claims one byte less than received.
    ShortReceiptReport,
    /// Answer Validate with a CRC error.
    ValidateCrcError,
    /// Never send packet receipt notifications.
    SilentReceipts,
    /// Refuse every connection.
    RejectConnection,
    /// Time out the next `times` connection attempts.
    ConnectTimeouts { times: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitSizes(DfuImageType),
    Ready(DfuImageType),
    Init(DfuImageType),
    Receiving(DfuImageType),
}

/// Observable state of the simulated peripheral.
pub struct PeripheralState {
    pub mode: DeviceMode,
    pub connected: bool,
    pub connects: Vec<String>,
    pub mtu_requests: Vec<usize>,
    /// Image bytes received for the current part.
    pub image: Vec<u8>,
    pub init_packets: Vec<Vec<u8>>,
    pub start_sizes: Vec<[u32; 3]>,
    /// Parts activated, in order.
    pub activated: Vec<(DfuImageType, Vec<u8>)>,
    /// Most image packets ever received without a consumed receipt.
    pub max_in_flight: usize,
    pub link_losses: usize,
    pub resets: usize,
    application_address: String,
    bootloader_address: String,
    faults: Vec<Fault>,
    phase: Phase,
    expected_len: usize,
    init_buffer: Vec<u8>,
    prn: u16,
    packets_received: usize,
    packets_acked: usize,
    /// Notifications with the packet count they acknowledge, if any.
    queue: VecDeque<(Notification, Option<usize>)>,
    pending_reboot: bool,
    stay_in_bootloader: bool,
    connect_delay: Duration,
    max_mtu: usize,
}

impl PeripheralState {
    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn notify(&mut self, value: Vec<u8>) {
        self.queue
            .push_back((Notification::new(DfuCharacteristic::ControlPoint, value), None));
    }

    fn respond(&mut self, request: u8, status: u8, payload: &[u8]) {
        let mut value = vec![0x10, request, status];
        value.extend_from_slice(payload);
        self.notify(value);
    }

    /// Link drops and the peer comes back in bootloader mode.
    fn reboot_into_bootloader(&mut self) {
        self.connected = false;
        self.pending_reboot = false;
        self.mode = DeviceMode::Bootloader;
        self.phase = Phase::Idle;
        self.queue.clear();
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.link_losses += 1;
        self.queue.clear();
    }

    fn advertised_address(&self) -> &str {
        match self.mode {
            DeviceMode::Application => &self.application_address,
            DeviceMode::Bootloader => &self.bootloader_address,
        }
    }

    fn take_connect_timeout(&mut self) -> bool {
        for fault in self.faults.iter_mut() {
            if let Fault::ConnectTimeouts { times } = fault {
                if *times > 0 {
                    *times -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn take_link_loss(&mut self) -> bool {
        let received = self.packets_received;
        for fault in self.faults.iter_mut() {
            if let Fault::LinkLossAfterPackets { after, times } = fault {
                if *after == received && *times > 0 {
                    *times -= 1;
                    return true;
                }
            }
        }
        false
    }

    fn on_control(&mut self, data: &[u8]) {
        match (self.phase, data) {
            (_, [0x01, kind]) => {
                if let Some(kind) = DfuImageType::from_byte(*kind) {
                    self.phase = Phase::AwaitSizes(kind);
                } else {
                    self.respond(0x01, 0x03, &[]);
                }
            }
            (Phase::Ready(kind), [0x02, 0x00]) => {
                self.init_buffer.clear();
                self.phase = Phase::Init(kind);
            }
            (Phase::Init(kind), [0x02, 0x01]) => {
                let init = std::mem::take(&mut self.init_buffer);
                self.init_packets.push(init);
                self.phase = Phase::Ready(kind);
                self.respond(0x02, 0x01, &[]);
            }
            (_, [0x08, lo, hi]) => self.prn = u16::from_le_bytes([*lo, *hi]),
            (Phase::Ready(kind), [0x03]) => {
                self.image.clear();
                self.packets_received = 0;
                self.packets_acked = 0;
                self.phase = Phase::Receiving(kind);
            }
            (Phase::Receiving(_), [0x07]) => {
                let mut crc = crc16::State::<crc16::CCITT_FALSE>::calculate(&self.image);
                if self.has_fault(Fault::CorruptReceiptCrc) {
                    crc ^= 0xFFFF;
                }
                let mut offset = self.image.len() as u32;
                if self.has_fault(Fault::ShortReceiptReport) {
                    offset = offset.saturating_sub(1);
                }
                let mut payload = offset.to_le_bytes().to_vec();
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(0x07, 0x01, &payload);
            }
            (Phase::Receiving(_), [0x04]) => {
                let status = if self.has_fault(Fault::ValidateCrcError) { 0x05 } else { 0x01 };
                self.respond(0x04, status, &[]);
            }
            (Phase::Receiving(kind), [0x05]) => {
                self.activated.push((kind, std::mem::take(&mut self.image)));
                self.connected = false;
                self.queue.clear();
                self.phase = Phase::Idle;
                if kind == DfuImageType::Application && !self.stay_in_bootloader {
                    self.mode = DeviceMode::Application;
                }
            }
            (_, [0x06]) => {
                self.resets += 1;
                self.reboot_into_bootloader();
            }
            (_, [op, ..]) => self.respond(*op, 0x02, &[]),
            (_, []) => {}
        }
    }

    /// Handle one image packet. Returns the packet count when it was an image packet.
    fn on_packet(&mut self, data: &[u8]) -> Option<usize> {
        match self.phase {
            Phase::AwaitSizes(kind) => {
                let mut sizes = [0u32; 3];
                for (size, bytes) in sizes.iter_mut().zip(data.chunks(4)) {
                    if let Ok(raw) = <[u8; 4]>::try_from(bytes) {
                        *size = u32::from_le_bytes(raw);
                    }
                }
                self.start_sizes.push(sizes);
                self.expected_len = sizes.iter().sum::<u32>() as usize;
                self.phase = Phase::Ready(kind);
                self.respond(0x01, 0x01, &[]);
                None
            }
            Phase::Init(_) => {
                self.init_buffer.extend_from_slice(data);
                None
            }
            Phase::Receiving(_) => {
                self.image.extend_from_slice(data);
                self.packets_received += 1;
                let in_flight = self.packets_received - self.packets_acked;
                self.max_in_flight = self.max_in_flight.max(in_flight);

                let prn = self.prn.max(1) as usize;
                if !self.has_fault(Fault::SilentReceipts) && self.packets_received % prn == 0 {
                    let mut received = self.image.len() as u32;
                    if self.has_fault(Fault::ShortReceiptCount) {
                        received = received.saturating_sub(1);
                    }
                    let value = [vec![0x11], received.to_le_bytes().to_vec()].concat();
                    self.queue.push_back((
                        Notification::new(DfuCharacteristic::ControlPoint, value),
                        Some(self.packets_received),
                    ));
                }
                if self.image.len() == self.expected_len {
                    self.respond(0x03, 0x01, &[]);
                }
                Some(self.packets_received)
            }
            Phase::Idle | Phase::Ready(_) => None,
        }
    }
}

/// In-memory legacy DFU peripheral implementing [`BleTransport`].
///
/// Clones share state, so a test keeps one handle to inspect what the
/// session did while another is owned by the session.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    state: Arc<Mutex<PeripheralState>>,
    on_packet: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl SimulatedPeripheral {
    pub const APPLICATION_ADDRESS: &'static str = "C0:FF:EE:00:00:10";
    pub const BOOTLOADER_ADDRESS: &'static str = "C0:FF:EE:00:00:11";

    fn with_mode(mode: DeviceMode) -> Self {
        let state = PeripheralState {
            mode,
            connected: false,
            connects: Vec::new(),
            mtu_requests: Vec::new(),
            image: Vec::new(),
            init_packets: Vec::new(),
            start_sizes: Vec::new(),
            activated: Vec::new(),
            max_in_flight: 0,
            link_losses: 0,
            resets: 0,
            application_address: Self::APPLICATION_ADDRESS.to_string(),
            bootloader_address: Self::BOOTLOADER_ADDRESS.to_string(),
            faults: Vec::new(),
            phase: Phase::Idle,
            expected_len: 0,
            init_buffer: Vec::new(),
            prn: 0,
            packets_received: 0,
            packets_acked: 0,
            queue: VecDeque::new(),
            pending_reboot: false,
            stay_in_bootloader: false,
            connect_delay: Duration::ZERO,
            max_mtu: 247,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            on_packet: None,
        }
    }

    /// Peer running its application, reachable at [`Self::APPLICATION_ADDRESS`].
    pub fn application() -> Self {
        Self::with_mode(DeviceMode::Application)
    }

    /// Peer already in bootloader mode at [`Self::BOOTLOADER_ADDRESS`].
    pub fn bootloader() -> Self {
        Self::with_mode(DeviceMode::Bootloader)
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.state.lock().unwrap().faults.push(fault);
        self
    }

    pub fn with_bootloader_address(self, address: &str) -> Self {
        self.state.lock().unwrap().bootloader_address = address.to_string();
        self
    }

    /// Keep running the bootloader after an application is activated, so
    /// the same address can be updated again.
    pub fn stay_in_bootloader(self) -> Self {
        self.state.lock().unwrap().stay_in_bootloader = true;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().connect_delay = delay;
        self
    }

    pub fn with_max_mtu(self, mtu: usize) -> Self {
        self.state.lock().unwrap().max_mtu = mtu;
        self
    }

    /// Call `hook` with the packet count after every image packet.
    pub fn on_packet(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_packet = Some(Arc::new(hook));
        self
    }

    pub fn log(&self) -> Arc<Mutex<PeripheralState>> {
        self.state.clone()
    }
}

impl BleTransport for SimulatedPeripheral {
    fn connect(&mut self, address: &str, _timeout: Duration) -> DfuResult<DeviceMode> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.connects.push(address.to_string());
            state.connect_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock().unwrap();
        if state.has_fault(Fault::RejectConnection) {
            return Err(ConnectError::Rejected {
                reason: "bonding required".into(),
            }
            .into());
        }
        if state.take_connect_timeout()
            || normalize_address(address) != normalize_address(state.advertised_address())
        {
            return Err(ConnectError::Timeout {
                operation: "connect",
            }
            .into());
        }

        state.connected = true;
        state.queue.clear();
        Ok(state.mode)
    }

    fn request_mtu(&mut self, preferred: usize, _timeout: Duration) -> DfuResult<usize> {
        let mut state = self.state.lock().unwrap();
        state.mtu_requests.push(preferred);
        Ok(preferred.min(state.max_mtu))
    }

    fn write(&mut self, characteristic: DfuCharacteristic, data: &[u8]) -> DfuResult<()> {
        let packet = {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(WriteError::NotConnected.into());
            }

            match (characteristic, state.mode) {
                (DfuCharacteristic::Buttonless, DeviceMode::Application) => {
                    if state.has_fault(Fault::RebootWithoutResponse) {
                        state.reboot_into_bootloader();
                    } else {
                        state.queue.push_back((
                            Notification::new(DfuCharacteristic::Buttonless, [0x20, 0x01, 0x01]),
                            None,
                        ));
                        state.pending_reboot = true;
                    }
                    None
                }
                (DfuCharacteristic::ControlPoint, DeviceMode::Bootloader) => {
                    state.on_control(data);
                    None
                }
                (DfuCharacteristic::Packet, DeviceMode::Bootloader) => {
                    let count = state.on_packet(data);
                    if count.is_some() && state.take_link_loss() {
                        state.drop_link();
                    }
                    count
                }
                _ => {
                    return Err(DfuError::ServiceNotFound {
                        address: state.advertised_address().to_string(),
                    })
                }
            }
        };

        if let (Some(count), Some(hook)) = (packet, &self.on_packet) {
            hook(count);
        }
        Ok(())
    }

    fn read_notification(&mut self, timeout: Duration) -> DfuResult<Option<Notification>> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(ConnectError::LinkLost.into());
            }
            if let Some((notification, acked)) = state.queue.pop_front() {
                if let Some(packets) = acked {
                    state.packets_acked = packets;
                }
                return Ok(Some(notification));
            }
            if state.pending_reboot {
                state.reboot_into_bootloader();
                return Err(ConnectError::LinkLost.into());
            }
        }

        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.pending_reboot {
            state.reboot_into_bootloader();
        }
        state.connected = false;
        state.queue.clear();
    }
}

impl TransportFactory for SimulatedPeripheral {
    type Transport = SimulatedPeripheral;

    fn open(&self, _address: &str) -> DfuResult<Self::Transport> {
        Ok(self.clone())
    }
}
