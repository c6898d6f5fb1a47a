//! Network update server
//!
//! Listens for update invitations on UDP, pulls the image over a TCP
//! connection back to the uploader one chunk per `handle()`, and writes it
//! into the partition the flash partition table assigns to the target.
//! Application images go to the inactive OTA slot, which becomes the boot
//! slot once the image checks out. Also answers mDNS so uploaders can find
//! the board.

use core::future::poll_fn;
use core::task::Poll;

use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use embedded_io_async::Write as _;
use embedded_storage::Storage;
use esp_bootloader_esp_idf::ota::{Ota, Slot};
use esp_bootloader_esp_idf::partitions::{
    self, AppPartitionSubType, DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType,
};
use esp_println::println;
use esp_storage::FlashStorage;

use crate::espota::{self, Invitation, Transfer};
use crate::mdns::{self, UpdateAdvertiser};
use crate::update::{UpdateError, UpdateHooks, UpdateTarget, UpdateTransport};
use crate::{BoardError, config};

/// Largest image chunk read per `handle()`
const CHUNK_SIZE: usize = 1460;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(config::OTA_RECEIVE_TIMEOUT_MS);
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(config::MDNS_ANNOUNCE_INTERVAL_MS);

/// Socket storage for [`OtaServer`], kept in a `StaticCell`
pub struct OtaBuffers {
    invite_rx_meta: [PacketMetadata; 2],
    invite_rx: [u8; 256],
    invite_tx_meta: [PacketMetadata; 2],
    invite_tx: [u8; 64],
    mdns_rx_meta: [PacketMetadata; 4],
    mdns_rx: [u8; 1024],
    mdns_tx_meta: [PacketMetadata; 4],
    mdns_tx: [u8; 2048],
    image_rx: [u8; 4096],
    image_tx: [u8; 256],
}

impl OtaBuffers {
    pub const fn new() -> Self {
        Self {
            invite_rx_meta: [PacketMetadata::EMPTY; 2],
            invite_rx: [0; 256],
            invite_tx_meta: [PacketMetadata::EMPTY; 2],
            invite_tx: [0; 64],
            mdns_rx_meta: [PacketMetadata::EMPTY; 4],
            mdns_rx: [0; 1024],
            mdns_tx_meta: [PacketMetadata::EMPTY; 4],
            mdns_tx: [0; 2048],
            image_rx: [0; 4096],
            image_tx: [0; 256],
        }
    }
}

impl Default for OtaBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Flash partition that receives an image
#[derive(Debug, Clone, Copy)]
struct Region {
    offset: u32,
    capacity: u32,
    /// OTA slot to boot once an application image is stored
    boot: Option<Slot>,
}

struct Receiving {
    region: Region,
    transfer: Transfer,
    last_data: Instant,
}

enum Phase {
    Idle,
    Receiving(Receiving),
}

pub struct OtaServer<'a> {
    stack: Stack<'a>,
    invites: UdpSocket<'a>,
    mdns: UdpSocket<'a>,
    image: TcpSocket<'a>,
    flash: FlashStorage,
    phase: Phase,
    advertiser: Option<UpdateAdvertiser<'static>>,
    last_announce: Instant,
    reply: [u8; mdns::MAX_PACKET_SIZE],
    chunk: [u8; CHUNK_SIZE],
}

impl<'a> OtaServer<'a> {
    pub fn new(stack: Stack<'a>, buffers: &'a mut OtaBuffers) -> Self {
        let OtaBuffers {
            invite_rx_meta,
            invite_rx,
            invite_tx_meta,
            invite_tx,
            mdns_rx_meta,
            mdns_rx,
            mdns_tx_meta,
            mdns_tx,
            image_rx,
            image_tx,
        } = buffers;

        Self {
            stack,
            invites: UdpSocket::new(stack, invite_rx_meta, invite_rx, invite_tx_meta, invite_tx),
            mdns: UdpSocket::new(stack, mdns_rx_meta, mdns_rx, mdns_tx_meta, mdns_tx),
            image: TcpSocket::new(stack, image_rx, image_tx),
            flash: FlashStorage::new(),
            phase: Phase::Idle,
            advertiser: None,
            last_announce: Instant::now(),
            reply: [0; mdns::MAX_PACKET_SIZE],
            chunk: [0; CHUNK_SIZE],
        }
    }

    fn start_mdns(&mut self) {
        let Some(address) = self.stack.config_v4().map(|c| c.address.address()) else {
            println!("[MDNS] No IPv4 configuration available");
            return;
        };

        let advertiser = match UpdateAdvertiser::new(config::HOSTNAME, address) {
            Ok(advertiser) => advertiser,
            Err(e) => {
                println!("[MDNS] Cannot advertise {}: {}", config::HOSTNAME, e);
                return;
            }
        };

        if let Err(e) = self.stack.join_multicast_group(IpAddress::Ipv4(mdns::MDNS_GROUP)) {
            println!("[MDNS] Failed to join multicast group: {:?}", e);
        }
        match self.mdns.bind(mdns::MDNS_PORT) {
            Ok(()) => println!("[MDNS] Advertising {}._arduino._tcp.local", advertiser.hostname()),
            Err(e) => println!("[MDNS] Failed to bind mDNS socket: {:?}", e),
        }
        self.advertiser = Some(advertiser);
    }

    async fn announce(&mut self) {
        let Some(advertiser) = self.advertiser.as_ref() else {
            return;
        };

        match advertiser.announce(&mut self.reply) {
            Ok(packet) => {
                let group = IpEndpoint::new(IpAddress::Ipv4(mdns::MDNS_GROUP), mdns::MDNS_PORT);
                if let Err(e) = self.mdns.send_to(packet, group).await {
                    println!("[MDNS] Failed to send announcement: {:?}", e);
                }
            }
            Err(e) => println!("[MDNS] Cannot build announcement: {}", e),
        }
        self.last_announce = Instant::now();
    }

    async fn service_mdns(&mut self) {
        if self.advertiser.is_none() {
            return;
        }

        if self.last_announce.elapsed() > ANNOUNCE_INTERVAL {
            self.announce().await;
        }

        let mut query = [0u8; 512];
        let Some((len, meta)) = try_recv(&self.mdns, &mut query).await else {
            return;
        };
        let Some(advertiser) = self.advertiser.as_ref() else {
            return;
        };

        let legacy = meta.endpoint.port != mdns::MDNS_PORT;
        let to = if legacy {
            meta.endpoint
        } else {
            IpEndpoint::new(IpAddress::Ipv4(mdns::MDNS_GROUP), mdns::MDNS_PORT)
        };
        match advertiser.answer(&query[..len], legacy, &mut self.reply) {
            Ok(Some(reply)) => {
                if let Err(e) = self.mdns.send_to(reply, to).await {
                    println!("[MDNS] Failed to answer {}: {:?}", meta.endpoint, e);
                }
            }
            Ok(None) => {}
            Err(e) => println!("[MDNS] Cannot answer {}: {}", meta.endpoint, e),
        }
    }

    async fn accept_invitation<H: UpdateHooks>(&mut self, hooks: &mut H) {
        let mut datagram = [0u8; 128];
        let Some((len, meta)) = try_recv(&self.invites, &mut datagram).await else {
            return;
        };

        let invitation = match Invitation::parse(&datagram[..len]) {
            Ok(invitation) => invitation,
            Err(_) => {
                println!("[OTA] Ignoring malformed invitation from {}", meta.endpoint);
                return;
            }
        };
        if let Err(e) = self.invites.send_to(espota::ACCEPTED, meta.endpoint).await {
            println!("[OTA] Failed to answer invitation: {:?}", e);
            return;
        }

        let region = match locate(&mut self.flash, invitation.target) {
            Ok(region) => region,
            Err(e) => {
                println!("[OTA] No {} partition: {}", invitation.target.label(), e);
                hooks.on_error(UpdateError::Begin);
                return;
            }
        };
        if invitation.size > region.capacity {
            println!("[OTA] Image of {} bytes does not fit in {} bytes", invitation.size, region.capacity);
            hooks.on_error(UpdateError::Begin);
            return;
        }

        hooks.on_start(invitation.target);
        hooks.on_progress(0, invitation.size);

        let uploader = IpEndpoint::new(meta.endpoint.addr, invitation.port);
        self.image.set_timeout(Some(RECEIVE_TIMEOUT));
        match with_timeout(CONNECT_TIMEOUT, self.image.connect(uploader)).await {
            Ok(Ok(())) => {
                println!("[OTA] Writing {} bytes at {:#x}", invitation.size, region.offset);
                self.phase = Phase::Receiving(Receiving {
                    region,
                    transfer: Transfer::new(&invitation),
                    last_data: Instant::now(),
                });
            }
            _ => {
                println!("[OTA] Cannot reach uploader at {}", uploader);
                self.fail(hooks, UpdateError::Connect);
            }
        }
    }

    async fn receive_chunk<H: UpdateHooks>(&mut self, hooks: &mut H) {
        let Phase::Receiving(receiving) = &mut self.phase else {
            return;
        };

        if !self.image.can_recv() {
            if !self.image.may_recv() || receiving.last_data.elapsed() > RECEIVE_TIMEOUT {
                println!(
                    "[OTA] Transfer stalled at {} of {} bytes",
                    receiving.transfer.received(),
                    receiving.transfer.size()
                );
                self.fail(hooks, UpdateError::Receive);
            }
            return;
        }

        let len = match self.image.read(&mut self.chunk).await {
            Ok(len) if len > 0 => len,
            _ => {
                self.fail(hooks, UpdateError::Receive);
                return;
            }
        };

        let start = receiving.region.offset + receiving.transfer.received();
        let Ok(received) = receiving.transfer.record(&self.chunk[..len]) else {
            println!("[OTA] Uploader sent more than announced");
            self.fail(hooks, UpdateError::Receive);
            return;
        };
        if let Err(e) = self.flash.write(start, &self.chunk[..len]) {
            println!("[OTA] Flash write at {:#x} failed: {:?}", start, e);
            self.fail(hooks, UpdateError::Receive);
            return;
        }
        receiving.last_data = Instant::now();
        let size = receiving.transfer.size();
        let verified = receiving.transfer.is_complete().then(|| receiving.transfer.verify());
        let boot = receiving.region.boot;

        if !send(&mut self.image, espota::chunk_ack(len).as_bytes()).await {
            self.fail(hooks, UpdateError::Receive);
            return;
        }
        hooks.on_progress(received, size);

        match verified {
            None => {}
            Some(Ok(())) => self.finish(hooks, boot).await,
            Some(Err(_)) => {
                println!("[OTA] MD5 mismatch, image rejected");
                self.fail(hooks, UpdateError::End);
            }
        }
    }

    async fn finish<H: UpdateHooks>(&mut self, hooks: &mut H, boot: Option<Slot>) {
        if let Some(slot) = boot {
            if let Err(e) = activate(&mut self.flash, slot) {
                println!("[OTA] Cannot select boot slot {:?}: {}", slot, e);
                self.fail(hooks, UpdateError::End);
                return;
            }
        }
        if !send(&mut self.image, espota::ACCEPTED).await {
            self.fail(hooks, UpdateError::End);
            return;
        }
        self.image.close();
        self.phase = Phase::Idle;
        hooks.on_end();

        println!("[OTA] Image stored, restarting");
        Timer::after(Duration::from_millis(200)).await;
        esp_hal::system::software_reset();
    }

    fn fail<H: UpdateHooks>(&mut self, hooks: &mut H, error: UpdateError) {
        self.image.abort();
        self.phase = Phase::Idle;
        println!("[OTA] Transfer aborted: {}", BoardError::from(error));
        hooks.on_error(error);
    }
}

impl UpdateTransport for OtaServer<'_> {
    async fn begin(&mut self) {
        match self.invites.bind(config::OTA_PORT) {
            Ok(()) => println!("[OTA] Listening for invitations on UDP {}", config::OTA_PORT),
            Err(e) => println!("[OTA] Failed to bind UDP {}: {:?}", config::OTA_PORT, e),
        }

        self.start_mdns();
        self.announce().await;
    }

    async fn handle<H: UpdateHooks>(&mut self, hooks: &mut H) {
        self.service_mdns().await;

        match self.phase {
            Phase::Idle => self.accept_invitation(hooks).await,
            Phase::Receiving(_) => self.receive_chunk(hooks).await,
        }
    }
}

/// Find the partition an image for `target` is written to.
///
/// Applications go to the OTA slot after the running one; filesystem images
/// to the SPIFFS data partition.
fn locate(flash: &mut FlashStorage, target: UpdateTarget) -> Result<Region, BoardError> {
    let mut table = [0u8; PARTITION_TABLE_MAX_LEN];
    let table = partitions::read_partition_table(&mut *flash, &mut table).map_err(|_| BoardError::UpdateError)?;

    let (kind, boot) = match target {
        UpdateTarget::Filesystem => (PartitionType::Data(DataPartitionSubType::Spiffs), None),
        UpdateTarget::Application => {
            let otadata = table
                .find_partition(PartitionType::Data(DataPartitionSubType::Ota))
                .map_err(|_| BoardError::UpdateError)?
                .ok_or(BoardError::UpdateError)?;
            let mut otadata = otadata.as_embedded_storage(flash);
            let mut ota = Ota::new(&mut otadata).map_err(|_| BoardError::UpdateError)?;
            let next = ota.current_slot().map_err(|_| BoardError::UpdateError)?.next();
            let subtype = match next {
                Slot::Slot1 => AppPartitionSubType::Ota1,
                _ => AppPartitionSubType::Ota0,
            };
            (PartitionType::App(subtype), Some(next))
        }
    };

    let partition = table
        .find_partition(kind)
        .map_err(|_| BoardError::UpdateError)?
        .ok_or(BoardError::UpdateError)?;
    Ok(Region {
        offset: partition.offset(),
        capacity: partition.len(),
        boot,
    })
}

/// Record `slot` in otadata so the bootloader starts it after the reset
fn activate(flash: &mut FlashStorage, slot: Slot) -> Result<(), BoardError> {
    let mut table = [0u8; PARTITION_TABLE_MAX_LEN];
    let table = partitions::read_partition_table(&mut *flash, &mut table).map_err(|_| BoardError::UpdateError)?;
    let otadata = table
        .find_partition(PartitionType::Data(DataPartitionSubType::Ota))
        .map_err(|_| BoardError::UpdateError)?
        .ok_or(BoardError::UpdateError)?;
    let mut otadata = otadata.as_embedded_storage(flash);
    let mut ota = Ota::new(&mut otadata).map_err(|_| BoardError::UpdateError)?;
    ota.set_current_slot(slot).map_err(|_| BoardError::UpdateError)
}

/// Take one datagram if one is already queued
async fn try_recv(socket: &UdpSocket<'_>, buf: &mut [u8]) -> Option<(usize, UdpMetadata)> {
    poll_fn(|cx| match socket.poll_recv_from(&mut *buf, cx) {
        Poll::Ready(Ok(received)) => Poll::Ready(Some(received)),
        Poll::Ready(Err(_)) | Poll::Pending => Poll::Ready(None),
    })
    .await
}

async fn send(socket: &mut TcpSocket<'_>, bytes: &[u8]) -> bool {
    socket.write_all(bytes).await.is_ok() && socket.flush().await.is_ok()
}
