//! One opened RDMA device: protection domain, registered memory, the UD
//! control plane used to set up connections, and RC sessions to peers.

use std::{
    collections::HashMap,
    io,
    mem::MaybeUninit,
    ptr::{NonNull, null_mut},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rdma_mummy_sys::{
    ibv_ah, ibv_ah_attr, ibv_create_ah, ibv_destroy_ah, ibv_global_route, ibv_modify_qp,
    ibv_port_attr, ibv_post_send, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_state, ibv_query_port,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode,
};
use sideway::ibverbs::{
    AccessFlags,
    address::{AddressHandleAttribute, Gid},
    completion::{
        GenericCompletionQueue, GenericWorkCompletion, PollCompletionQueueError,
        WorkCompletionOperationType, WorkCompletionStatus,
    },
    device::{DeviceInfo, DeviceList},
    device_context::{DeviceContext, LinkLayer, Mtu, PortState},
    memory_region::MemoryRegion as VerbsRegion,
    protection_domain::ProtectionDomain,
    queue_pair::{
        GenericQueuePair, PostSendGuard, QueuePair, QueuePairAttribute, QueuePairState,
        QueuePairType, SendOperationFlags, SetScatterGatherEntry, WorkRequestFlags,
    },
};

use super::{
    VerbsError,
    completion::{CompletionTable, WcOutcome},
    control_protocol::{ControlMessage, RcEndpoint, decode_message, encode_message},
    domain_address::{DomainAddress, to_hex},
};
use crate::{api::OpCode, metadata::DeviceDesc};

const UD_QKEY: u32 = 0x1111_1111;
const UD_RECV_SLOTS: usize = 64;
const UD_BUFFER_BYTES: usize = 512;
const UD_GRH_BYTES: usize = 40;

fn verbs(error: impl std::fmt::Display) -> VerbsError {
    VerbsError::Verbs(error.to_string())
}

#[derive(Default)]
struct PendingReplies {
    next_request_id: AtomicU64,
    replies: Mutex<HashMap<u64, Option<ControlMessage>>>,
    reply_cv: Condvar,
}

impl PendingReplies {
    fn begin(&self) -> u64 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.replies.lock().insert(request_id, None);
        request_id
    }

    fn wait(&self, request_id: u64, timeout: Duration) -> Option<ControlMessage> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.replies.lock();
        loop {
            match guard.get_mut(&request_id) {
                Some(slot) => {
                    if let Some(message) = slot.take() {
                        guard.remove(&request_id);
                        return Some(message);
                    }
                }
                None => return None,
            }

            let now = Instant::now();
            if now >= deadline {
                guard.remove(&request_id);
                return None;
            }
            self.reply_cv.wait_for(&mut guard, deadline - now);
        }
    }

    fn deliver(&self, message: ControlMessage) {
        let request_id = message.request_id();
        let mut guard = self.replies.lock();
        if let Some(slot) = guard.get_mut(&request_id) {
            *slot = Some(message);
            self.reply_cv.notify_all();
        }
    }
}

struct AddressHandle {
    ah: NonNull<ibv_ah>,
}

impl Drop for AddressHandle {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_ah(self.ah.as_ptr());
        }
    }
}

unsafe impl Send for AddressHandle {}
unsafe impl Sync for AddressHandle {}

struct UdRecvSlot {
    bytes: Box<[u8]>,
    mr: Arc<VerbsRegion>,
}

struct UdSendSlot {
    bytes: Box<[u8]>,
    mr: Arc<VerbsRegion>,
    next_wr_id: u64,
}

pub(crate) struct RcSession {
    qp: Mutex<GenericQueuePair>,
    send_cq: GenericCompletionQueue,
    _recv_cq: GenericCompletionQueue,
    local_rc: RcEndpoint,
    next_wr_id: AtomicU64,
    completions: CompletionTable,
}

struct PortInfo {
    port_num: u8,
    gid_index: u8,
    link_layer: LinkLayer,
    mtu: Mtu,
    gid: Gid,
    lid: u16,
}

pub(crate) struct RdmaContext {
    name: String,
    device_ctx: Arc<DeviceContext>,
    pd: Arc<ProtectionDomain>,
    port: PortInfo,
    local_ud: DomainAddress,
    ud_qp: Mutex<GenericQueuePair>,
    ud_cq: GenericCompletionQueue,
    recv_slots: Vec<UdRecvSlot>,
    send_slot: Mutex<UdSendSlot>,
    ah_cache: Mutex<HashMap<DomainAddress, Arc<AddressHandle>>>,
    pending: PendingReplies,
    sessions: Mutex<HashMap<DomainAddress, Arc<RcSession>>>,
    regions: Mutex<HashMap<u64, Arc<VerbsRegion>>>,
    handshake_timeout: Duration,
}

impl RdmaContext {
    pub(crate) fn open(name: &str, handshake_timeout: Duration) -> Result<Arc<Self>, VerbsError> {
        let device_list = DeviceList::new().map_err(verbs)?;
        let device = device_list
            .iter()
            .find(|device| device.name() == name)
            .ok_or_else(|| VerbsError::DeviceNotFound(name.to_string()))?;

        let device_ctx = device.open().map_err(verbs)?;
        let pd = device_ctx.alloc_pd().map_err(verbs)?;
        let port = choose_port_and_gid(&device_ctx)?;

        let mut cq_builder = device_ctx.create_cq_builder();
        cq_builder.setup_cqe(256);
        let ud_cq: GenericCompletionQueue = cq_builder.build().map_err(verbs)?.into();

        let mut qp_builder = pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::UnreliableDatagram)
            .setup_send_ops_flags(SendOperationFlags::Send | SendOperationFlags::SendWithImmediate)
            .setup_send_cq(ud_cq.clone())
            .setup_recv_cq(ud_cq.clone())
            .setup_max_send_wr(256)
            .setup_max_recv_wr(256)
            .setup_max_send_sge(1)
            .setup_max_recv_sge(1);
        let mut ud_qp: GenericQueuePair = qp_builder.build_ex().map_err(verbs)?.into();
        setup_ud_qp(&mut ud_qp, port.port_num)?;

        let local_ud = DomainAddress {
            gid: port.gid.raw,
            lid: port.lid,
            qp_num: ud_qp.qp_number(),
            qkey: UD_QKEY,
        };

        let mut recv_slots = Vec::with_capacity(UD_RECV_SLOTS);
        for _ in 0..UD_RECV_SLOTS {
            let bytes = vec![0_u8; UD_GRH_BYTES + UD_BUFFER_BYTES].into_boxed_slice();
            let mr = unsafe {
                pd.reg_mr(bytes.as_ptr() as usize, bytes.len(), AccessFlags::LocalWrite)
            }
            .map_err(verbs)?;
            recv_slots.push(UdRecvSlot { bytes, mr });
        }

        let send_bytes = vec![0_u8; UD_BUFFER_BYTES].into_boxed_slice();
        let send_mr = unsafe {
            pd.reg_mr(
                send_bytes.as_ptr() as usize,
                send_bytes.len(),
                AccessFlags::LocalWrite,
            )
        }
        .map_err(verbs)?;

        let context = Arc::new(Self {
            name: name.to_string(),
            device_ctx,
            pd,
            port,
            local_ud,
            ud_qp: Mutex::new(ud_qp),
            ud_cq,
            recv_slots,
            send_slot: Mutex::new(UdSendSlot {
                bytes: send_bytes,
                mr: send_mr,
                next_wr_id: 1_u64 << 63,
            }),
            ah_cache: Mutex::new(HashMap::new()),
            pending: PendingReplies::default(),
            sessions: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            handshake_timeout,
        });

        for idx in 0..context.recv_slots.len() {
            context.post_ud_recv(idx)?;
        }
        spawn_control_loop(Arc::downgrade(&context))?;
        info!("opened RDMA device {name}: {local_ud}");
        Ok(context)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            name: self.name.clone(),
            lid: self.port.lid,
            gid: to_hex(&self.port.gid.raw),
            control_addr: self.local_ud.to_hex(),
        }
    }

    pub(crate) fn register(&self, addr: u64, len: u64) -> Result<(), VerbsError> {
        let len = usize::try_from(len).map_err(verbs)?;
        let mr = unsafe {
            self.pd.reg_mr(
                addr as usize,
                len,
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
            )
        }
        .map_err(verbs)?;
        self.regions.lock().insert(addr, mr);
        Ok(())
    }

    pub(crate) fn unregister(&self, addr: u64) {
        self.regions.lock().remove(&addr);
    }

    pub(crate) fn rkey(&self, region_addr: u64) -> Option<u32> {
        self.regions.lock().get(&region_addr).map(|mr| mr.rkey())
    }

    pub(crate) fn lkey(&self, region_addr: u64) -> Option<u32> {
        self.regions.lock().get(&region_addr).map(|mr| mr.lkey())
    }

    fn post_ud_recv(&self, slot_idx: usize) -> Result<(), VerbsError> {
        let Some(slot) = self.recv_slots.get(slot_idx) else {
            return Err(VerbsError::Verbs("invalid UD recv slot index".to_string()));
        };

        let mut qp = self.ud_qp.lock();
        let mut guard = qp.start_post_recv();
        let wr = guard.construct_wr(slot_idx as u64);
        unsafe {
            wr.setup_sge(
                slot.mr.lkey(),
                slot.bytes.as_ptr() as u64,
                slot.bytes.len() as u32,
            );
        }
        guard.post().map_err(verbs)
    }

    fn get_or_create_ah(&self, peer: DomainAddress) -> Result<Arc<AddressHandle>, VerbsError> {
        if let Some(existing) = self.ah_cache.lock().get(&peer).cloned() {
            return Ok(existing);
        }

        let mut ah_attr = unsafe { MaybeUninit::<ibv_ah_attr>::zeroed().assume_init() };
        ah_attr.grh = ibv_global_route {
            dgid: Gid { raw: peer.gid }.into(),
            sgid_index: self.port.gid_index,
            hop_limit: 64,
            ..unsafe { MaybeUninit::<ibv_global_route>::zeroed().assume_init() }
        };
        ah_attr.dlid = peer.lid;
        ah_attr.is_global = u8::from(self.port.link_layer != LinkLayer::InfiniBand);
        ah_attr.port_num = self.port.port_num;
        let raw_ah = unsafe { ibv_create_ah(self.pd.pd().as_ptr(), &raw mut ah_attr) };
        let ah = NonNull::new(raw_ah).ok_or_else(|| {
            VerbsError::Verbs(format!("ibv_create_ah failed: {}", io::Error::last_os_error()))
        })?;
        let wrapped = Arc::new(AddressHandle { ah });
        Ok(Arc::clone(
            self.ah_cache
                .lock()
                .entry(peer)
                .or_insert_with(|| Arc::clone(&wrapped)),
        ))
    }

    fn send_control(
        &self,
        peer: DomainAddress,
        message: &ControlMessage,
    ) -> Result<(), VerbsError> {
        let payload = encode_message(message);
        let ah = self.get_or_create_ah(peer)?;

        let mut send_slot = self.send_slot.lock();
        if payload.len() > send_slot.bytes.len() {
            return Err(VerbsError::Verbs(
                "control message too large for UD send buffer".to_string(),
            ));
        }
        send_slot.bytes[..payload.len()].copy_from_slice(&payload);
        let wr_id = send_slot.next_wr_id;
        send_slot.next_wr_id = send_slot.next_wr_id.wrapping_add(1);

        let mut sge = ibv_sge {
            addr: send_slot.bytes.as_ptr() as u64,
            length: payload.len() as u32,
            lkey: send_slot.mr.lkey(),
        };
        let mut wr = unsafe { MaybeUninit::<ibv_send_wr>::zeroed().assume_init() };
        wr.wr_id = wr_id;
        wr.next = null_mut();
        wr.sg_list = &raw mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.ud.ah = ah.ah.as_ptr();
        wr.wr.ud.remote_qpn = peer.qp_num;
        wr.wr.ud.remote_qkey = peer.qkey;

        let qp = self.ud_qp.lock();
        let ret = unsafe { ibv_post_send(qp.qp().as_ptr(), &raw mut wr, null_mut()) };
        if ret != 0 {
            return Err(VerbsError::Verbs(format!(
                "ibv_post_send(UD) failed: {}",
                io::Error::from_raw_os_error(ret)
            )));
        }
        Ok(())
    }

    fn handle_ud_completion(&self, wc: &GenericWorkCompletion) {
        let is_recv = wc.opcode() == WorkCompletionOperationType::Receive as u32;
        if wc.status() == WorkCompletionStatus::Success as u32 && is_recv {
            let slot_idx = wc.wr_id() as usize;
            if let Some(slot) = self.recv_slots.get(slot_idx) {
                let byte_len = wc.byte_len() as usize;
                if byte_len > UD_GRH_BYTES && byte_len <= slot.bytes.len() {
                    match decode_message(&slot.bytes[UD_GRH_BYTES..byte_len]) {
                        Some(message) => self.handle_control(message),
                        None => debug!("{}: dropping malformed control datagram", self.name),
                    }
                }
            }
        }
        if is_recv {
            if let Err(error) = self.post_ud_recv(wc.wr_id() as usize) {
                warn!("{}: cannot repost UD receive: {error}", self.name);
            }
        }
    }

    fn handle_control(&self, message: ControlMessage) {
        match message {
            reply @ (ControlMessage::ConnectResp { .. } | ControlMessage::ConnectReject { .. }) => {
                self.pending.deliver(reply);
            }
            ControlMessage::ConnectReq {
                request_id,
                src,
                rc,
            } => {
                let response = match self.accept_session(src, rc) {
                    Ok(local_rc) => ControlMessage::ConnectResp {
                        request_id,
                        src: self.local_ud,
                        rc: local_rc,
                    },
                    Err(error) => {
                        warn!("{}: rejecting connection from {src}: {error}", self.name);
                        ControlMessage::ConnectReject {
                            request_id,
                            src: self.local_ud,
                        }
                    }
                };
                if let Err(error) = self.send_control(src, &response) {
                    warn!("{}: cannot answer {src}: {error}", self.name);
                }
            }
        }
    }

    fn create_rc_qp(&self, psn_seed: u64) -> Result<RcSession, VerbsError> {
        let mut cq_builder = self.device_ctx.create_cq_builder();
        cq_builder.setup_cqe(128);
        let send_cq: GenericCompletionQueue = cq_builder.build().map_err(verbs)?.into();
        let recv_cq: GenericCompletionQueue = cq_builder.build().map_err(verbs)?.into();

        let mut qp_builder = self.pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::ReliableConnection)
            .setup_send_cq(send_cq.clone())
            .setup_recv_cq(recv_cq.clone())
            .setup_max_send_wr(128)
            .setup_max_recv_wr(16)
            .setup_max_send_sge(1)
            .setup_max_recv_sge(1);
        let mut qp: GenericQueuePair = qp_builder.build().map_err(verbs)?.into();

        let mut init_attr = QueuePairAttribute::new();
        init_attr
            .setup_state(QueuePairState::Init)
            .setup_pkey_index(0)
            .setup_port(self.port.port_num)
            .setup_access_flags(
                AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
            );
        qp.modify(&init_attr).map_err(verbs)?;

        let local_rc = RcEndpoint {
            gid: self.port.gid.raw,
            lid: self.port.lid,
            qp_num: qp.qp_number(),
            psn: (psn_seed as u32) & 0x00ff_ffff,
        };
        Ok(RcSession {
            qp: Mutex::new(qp),
            send_cq,
            _recv_cq: recv_cq,
            local_rc,
            next_wr_id: AtomicU64::new(1),
            completions: CompletionTable::default(),
        })
    }

    fn connect_rc_qp(&self, session: &RcSession, remote_rc: RcEndpoint) -> Result<(), VerbsError> {
        let mut ah_attr = AddressHandleAttribute::new();
        ah_attr
            .setup_dest_lid(remote_rc.lid)
            .setup_port(self.port.port_num)
            .setup_grh_dest_gid(&Gid { raw: remote_rc.gid })
            .setup_grh_src_gid_index(self.port.gid_index)
            .setup_grh_hop_limit(64);

        let mut qp = session.qp.lock();
        let mut rtr_attr = QueuePairAttribute::new();
        rtr_attr
            .setup_state(QueuePairState::ReadyToReceive)
            .setup_path_mtu(self.port.mtu)
            .setup_dest_qp_num(remote_rc.qp_num)
            .setup_rq_psn(remote_rc.psn)
            .setup_max_dest_read_atomic(16)
            .setup_min_rnr_timer(12)
            .setup_address_vector(&ah_attr);
        qp.modify(&rtr_attr).map_err(verbs)?;

        let mut rts_attr = QueuePairAttribute::new();
        rts_attr
            .setup_state(QueuePairState::ReadyToSend)
            .setup_sq_psn(session.local_rc.psn)
            .setup_timeout(14)
            .setup_retry_cnt(7)
            .setup_rnr_retry(7)
            .setup_max_read_atomic(16);
        qp.modify(&rts_attr).map_err(verbs)?;
        Ok(())
    }

    fn retain_session(&self, peer: DomainAddress, session: RcSession) -> Arc<RcSession> {
        Arc::clone(
            self.sessions
                .lock()
                .entry(peer)
                .or_insert_with(|| Arc::new(session)),
        )
    }

    /// Passive side of the handshake.
    fn accept_session(
        &self,
        peer: DomainAddress,
        remote_rc: RcEndpoint,
    ) -> Result<RcEndpoint, VerbsError> {
        if let Some(existing) = self.sessions.lock().get(&peer).cloned() {
            return Ok(existing.local_rc);
        }
        let seed = self.pending.next_request_id.fetch_add(1, Ordering::Relaxed);
        let session = self.create_rc_qp(seed)?;
        self.connect_rc_qp(&session, remote_rc)?;
        Ok(self.retain_session(peer, session).local_rc)
    }

    /// RC session to `peer`, connecting on first use.
    pub(crate) fn session(&self, peer: DomainAddress) -> Result<Arc<RcSession>, VerbsError> {
        if let Some(existing) = self.sessions.lock().get(&peer).cloned() {
            return Ok(existing);
        }

        let request_id = self.pending.begin();
        let session = self.create_rc_qp(request_id)?;
        self.send_control(
            peer,
            &ControlMessage::ConnectReq {
                request_id,
                src: self.local_ud,
                rc: session.local_rc,
            },
        )?;

        let remote_rc = match self.pending.wait(request_id, self.handshake_timeout) {
            Some(ControlMessage::ConnectResp { src, rc, .. }) if src == peer => rc,
            Some(ControlMessage::ConnectReject { .. }) => {
                return Err(VerbsError::Rejected(peer.to_string()));
            }
            Some(other) => {
                return Err(VerbsError::Verbs(format!(
                    "unexpected connect response: {other:?}"
                )));
            }
            None => return Err(VerbsError::Timeout("connect handshake")),
        };
        self.connect_rc_qp(&session, remote_rc)?;
        debug!("{}: connected to {peer}", self.name);
        Ok(self.retain_session(peer, session))
    }

    /// Drops a session after a failed work request so the next slice
    /// reconnects instead of reusing a queue pair in the error state.
    pub(crate) fn reset_session(&self, peer: DomainAddress) {
        self.sessions.lock().remove(&peer);
    }

    /// One-sided RDMA WRITE or READ of `len` bytes, waiting for completion.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn post(
        &self,
        session: &RcSession,
        opcode: OpCode,
        lkey: u32,
        local_addr: u64,
        rkey: u32,
        remote_addr: u64,
        len: u64,
        timeout: Duration,
    ) -> Result<(), VerbsError> {
        let len = u32::try_from(len)
            .map_err(|_| VerbsError::Verbs("slice exceeds RDMA SGE length limit".to_string()))?;

        let wr_id = session.next_wr_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut qp = session.qp.lock();
            let mut guard = qp.start_post_send();
            let wr = guard.construct_wr(wr_id, WorkRequestFlags::Signaled);
            let wr = match opcode {
                OpCode::Write => wr.setup_write(rkey, remote_addr),
                OpCode::Read => wr.setup_read(rkey, remote_addr),
            };
            unsafe {
                wr.setup_sge(lkey, local_addr, len);
            }
            guard.post().map_err(verbs)?;
        }
        session
            .completions
            .wait(wr_id, Instant::now() + timeout, || drain_send_cq(&session.send_cq))
    }
}

fn drain_send_cq(send_cq: &GenericCompletionQueue) -> Result<Vec<(u64, WcOutcome)>, VerbsError> {
    let mut drained = Vec::new();
    match send_cq.start_poll() {
        Ok(mut poller) => {
            for wc in &mut poller {
                let outcome = if wc.status() == WorkCompletionStatus::Success as u32 {
                    Ok(())
                } else {
                    Err(format!(
                        "work completion failed: status={}, opcode={}, vendor_err={}",
                        wc.status(),
                        wc.opcode(),
                        wc.vendor_err()
                    ))
                };
                drained.push((wc.wr_id(), outcome));
            }
        }
        Err(PollCompletionQueueError::CompletionQueueEmpty) => {}
        Err(error) => {
            return Err(VerbsError::Verbs(format!("poll send CQ failed: {error}")));
        }
    }
    Ok(drained)
}

fn choose_port_and_gid(device_ctx: &Arc<DeviceContext>) -> Result<PortInfo, VerbsError> {
    let dev_attr = device_ctx.query_device().map_err(verbs)?;
    let gid_entries = device_ctx.query_gid_table().map_err(verbs)?;

    for port_num in 1..=dev_attr.phys_port_cnt() {
        let port_attr = device_ctx.query_port(port_num).map_err(verbs)?;
        if port_attr.port_state() != PortState::Active {
            continue;
        }

        // Prefer a routable GID; fall back to link-local.
        let mut picked: Option<(u8, Gid)> = None;
        for entry in gid_entries
            .iter()
            .filter(|entry| entry.port_num() == port_num as u32)
        {
            let gid = entry.gid();
            if gid.is_zero() {
                continue;
            }
            if !gid.is_unicast_link_local() {
                picked = Some((entry.gid_index() as u8, gid));
                break;
            }
            if picked.is_none() {
                picked = Some((entry.gid_index() as u8, gid));
            }
        }

        let (gid_index, gid) = match picked {
            Some(picked) => picked,
            None => (0, device_ctx.query_gid(port_num, 0).map_err(verbs)?),
        };

        let mut raw_port = unsafe { MaybeUninit::<ibv_port_attr>::zeroed().assume_init() };
        let ret =
            unsafe { ibv_query_port(device_ctx.context().as_ptr(), port_num, &raw mut raw_port) };
        if ret != 0 {
            return Err(VerbsError::Verbs(format!(
                "query raw port attr failed: {}",
                io::Error::from_raw_os_error(ret)
            )));
        }

        return Ok(PortInfo {
            port_num,
            gid_index,
            link_layer: port_attr.link_layer(),
            mtu: port_attr.active_mtu(),
            gid,
            lid: raw_port.lid,
        });
    }

    Err(VerbsError::Verbs("no active port found".to_string()))
}

fn setup_ud_qp(qp: &mut GenericQueuePair, port_num: u8) -> Result<(), VerbsError> {
    let qp_ptr = unsafe { qp.qp().as_ptr() };

    let mut init_attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
    init_attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
    init_attr.pkey_index = 0;
    init_attr.port_num = port_num;
    init_attr.qkey = UD_QKEY;
    let init_mask = (ibv_qp_attr_mask::IBV_QP_STATE.0
        | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0
        | ibv_qp_attr_mask::IBV_QP_PORT.0
        | ibv_qp_attr_mask::IBV_QP_QKEY.0) as i32;
    let ret = unsafe { ibv_modify_qp(qp_ptr, &raw mut init_attr, init_mask) };
    if ret != 0 {
        return Err(VerbsError::Verbs(format!(
            "UD QP RESET->INIT failed: {}",
            io::Error::from_raw_os_error(ret)
        )));
    }

    let mut rtr_attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
    rtr_attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
    let ret = unsafe {
        ibv_modify_qp(
            qp_ptr,
            &raw mut rtr_attr,
            ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
        )
    };
    if ret != 0 {
        return Err(VerbsError::Verbs(format!(
            "UD QP INIT->RTR failed: {}",
            io::Error::from_raw_os_error(ret)
        )));
    }

    let mut rts_attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
    rts_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
    rts_attr.sq_psn = 0;
    let rts_mask = (ibv_qp_attr_mask::IBV_QP_STATE.0 | ibv_qp_attr_mask::IBV_QP_SQ_PSN.0) as i32;
    let ret = unsafe { ibv_modify_qp(qp_ptr, &raw mut rts_attr, rts_mask) };
    if ret != 0 {
        return Err(VerbsError::Verbs(format!(
            "UD QP RTR->RTS failed: {}",
            io::Error::from_raw_os_error(ret)
        )));
    }
    Ok(())
}

/// Polls the UD completion queue until the context is dropped.
fn spawn_control_loop(weak: Weak<RdmaContext>) -> Result<(), VerbsError> {
    thread::Builder::new()
        .name("segflow-rdma-control".to_string())
        .spawn(move || {
            while let Some(context) = weak.upgrade() {
                match context.ud_cq.start_poll() {
                    Ok(mut poller) => {
                        let mut did_work = false;
                        for wc in &mut poller {
                            did_work = true;
                            context.handle_ud_completion(&wc);
                        }
                        if !did_work {
                            thread::sleep(Duration::from_micros(50));
                        }
                    }
                    Err(PollCompletionQueueError::CompletionQueueEmpty) => {
                        thread::sleep(Duration::from_micros(100));
                    }
                    Err(_) => thread::sleep(Duration::from_millis(1)),
                }
            }
        })
        .map(|_| ())
        .map_err(verbs)
}
