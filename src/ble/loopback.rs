// Loopback BLE fabric
//
// Connects any number of in-process endpoints without a radio. Advertising
// data is delivered to every scanning endpoint each tick, connect requests
// resolve against connectable advertisers, and GATT writes are handed to the
// peer on the next tick. Used by the integration tests and the demo binary.
//
// This is a functional double, not a radio model: duty cycles, channel
// collisions and air time are not simulated.

use super::api::{
    AdvParams, AdvType, BleError, BleEvent, BleGapAddr, BlePlatform, ConnHandle, ConnRole,
    HciReason, ScanParams,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::trace;

const DEFAULT_RSSI: i8 = -55;

struct EndpointState {
    addr: BleGapAddr,
    advertising: Option<(AdvParams, Vec<u8>, Vec<u8>)>,
    scanning: Option<ScanParams>,
    pending_connect: Option<PendingConnect>,
    events: VecDeque<BleEvent>,
    /// Makes the next N gatt writes fail, for fault-injection tests
    fail_writes: u32,
    rssi: i8,
    /// Radio silence: nothing is heard from or delivered to this endpoint
    unreachable: bool,
}

struct PendingConnect {
    target: BleGapAddr,
    timeout_ds: u16,
    elapsed_ds: u16,
}

struct LinkState {
    sides: [(usize, ConnHandle); 2],
    mtu: u16,
    /// Writes in flight: (destination endpoint, destination handle,
    /// source endpoint, source handle, characteristic, payload)
    pending: VecDeque<(usize, ConnHandle, usize, ConnHandle, u16, Vec<u8>)>,
}

impl LinkState {
    fn side_of(&self, endpoint: usize) -> Option<usize> {
        self.sides.iter().position(|(e, _)| *e == endpoint)
    }

    fn handle_of(&self, endpoint: usize) -> Option<ConnHandle> {
        self.side_of(endpoint).map(|i| self.sides[i].1)
    }
}

struct FabricInner {
    endpoints: Vec<EndpointState>,
    links: Vec<Option<LinkState>>,
    next_handle: u16,
    default_mtu: u16,
}

impl FabricInner {
    fn link_by_handle(&mut self, endpoint: usize, conn: ConnHandle) -> Option<usize> {
        self.links.iter().position(|l| {
            l.as_ref()
                .map(|l| l.sides.iter().any(|(e, h)| *e == endpoint && *h == conn))
                .unwrap_or(false)
        })
    }

    fn teardown_link(&mut self, link_idx: usize, initiator: Option<usize>, reason: HciReason) {
        let Some(link) = self.links[link_idx].take() else {
            return;
        };
        for (endpoint, handle) in link.sides {
            let r = match initiator {
                Some(init) if init != endpoint && reason == HciReason::LOCAL_HOST_TERMINATED => {
                    HciReason::REMOTE_USER_TERMINATED
                }
                _ => reason,
            };
            self.endpoints[endpoint].events.push_back(BleEvent::Disconnected {
                conn: handle,
                reason: r,
            });
        }
    }
}

/// Shared in-memory BLE medium
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Rc<RefCell<FabricInner>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(FabricInner {
                endpoints: Vec::new(),
                links: Vec::new(),
                next_handle: 0x10,
                default_mtu: 20,
            })),
        }
    }

    /// Per-write payload budget that newly created links start with
    pub fn set_default_mtu(&self, mtu: u16) {
        self.inner.borrow_mut().default_mtu = mtu;
    }

    /// Register a new endpoint and get its radio handle
    pub fn endpoint(&self, addr: BleGapAddr) -> LoopbackBle {
        let mut inner = self.inner.borrow_mut();
        inner.endpoints.push(EndpointState {
            addr,
            advertising: None,
            scanning: None,
            pending_connect: None,
            events: VecDeque::new(),
            fail_writes: 0,
            rssi: DEFAULT_RSSI,
            unreachable: false,
        });
        LoopbackBle {
            inner: Rc::clone(&self.inner),
            index: inner.endpoints.len() - 1,
        }
    }

    /// Drain one pending upcall for an endpoint
    pub fn take_event(&self, endpoint: usize) -> Option<BleEvent> {
        self.inner.borrow_mut().endpoints[endpoint].events.pop_front()
    }

    /// RSSI that other endpoints observe for this endpoint's advertisements
    pub fn set_rssi(&self, endpoint: usize, rssi: i8) {
        self.inner.borrow_mut().endpoints[endpoint].rssi = rssi;
    }

    /// Make the next `count` gatt writes from this endpoint fail
    pub fn fail_writes(&self, endpoint: usize, count: u32) {
        self.inner.borrow_mut().endpoints[endpoint].fail_writes = count;
    }

    pub fn set_unreachable(&self, endpoint: usize, unreachable: bool) {
        self.inner.borrow_mut().endpoints[endpoint].unreachable = unreachable;
    }

    /// Renegotiate the MTU of the link between two endpoints; both sides
    /// receive an `MtuChanged` upcall.
    pub fn set_link_mtu(&self, a: usize, b: usize, mtu: u16) -> bool {
        let mut inner = self.inner.borrow_mut();
        let idx = inner.links.iter().position(|l| {
            l.as_ref()
                .map(|l| l.side_of(a).is_some() && l.side_of(b).is_some())
                .unwrap_or(false)
        });
        let Some(idx) = idx else {
            return false;
        };
        let sides = {
            let link = inner.links[idx].as_mut().unwrap();
            link.mtu = mtu;
            link.sides
        };
        for (endpoint, handle) in sides {
            inner.endpoints[endpoint]
                .events
                .push_back(BleEvent::MtuChanged { conn: handle, mtu });
        }
        true
    }

    /// Drop the link between two endpoints as if the radio lost it
    pub fn drop_link(&self, a: usize, b: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        let idx = inner.links.iter().position(|l| {
            l.as_ref()
                .map(|l| l.side_of(a).is_some() && l.side_of(b).is_some())
                .unwrap_or(false)
        });
        match idx {
            Some(idx) => {
                inner.teardown_link(idx, None, HciReason::CONNECTION_TIMEOUT);
                true
            }
            None => false,
        }
    }

    pub fn link_count(&self) -> usize {
        self.inner.borrow().links.iter().flatten().count()
    }

    /// Advance the fabric: resolve connects, deliver advertising reports and
    /// queued writes.
    pub fn tick(&self, passed_ds: u16) {
        let mut inner = self.inner.borrow_mut();

        // Connect attempts against connectable advertisers
        for i in 0..inner.endpoints.len() {
            let Some(pending) = inner.endpoints[i].pending_connect.take() else {
                continue;
            };
            if inner.endpoints[i].unreachable {
                inner.endpoints[i].pending_connect = Some(pending);
                continue;
            }
            let target = inner.endpoints.iter().position(|e| {
                e.addr == pending.target
                    && !e.unreachable
                    && matches!(
                        e.advertising,
                        Some((
                            AdvParams {
                                adv_type: AdvType::ConnectableUndirected,
                                ..
                            },
                            _,
                            _
                        ))
                    )
            });
            match target {
                Some(j) => {
                    let handle_a = ConnHandle(inner.next_handle);
                    let handle_b = ConnHandle(inner.next_handle + 1);
                    inner.next_handle += 2;
                    let mtu = inner.default_mtu;
                    inner.links.push(Some(LinkState {
                        sides: [(i, handle_a), (j, handle_b)],
                        mtu,
                        pending: VecDeque::new(),
                    }));
                    let peer_addr = inner.endpoints[j].addr;
                    let own_addr = inner.endpoints[i].addr;
                    trace!(central = i, peripheral = j, "loopback link established");
                    inner.endpoints[i].events.push_back(BleEvent::Connected {
                        conn: handle_a,
                        addr: peer_addr,
                        role: ConnRole::Central,
                    });
                    inner.endpoints[j].events.push_back(BleEvent::Connected {
                        conn: handle_b,
                        addr: own_addr,
                        role: ConnRole::Peripheral,
                    });
                }
                None => {
                    let mut pending = pending;
                    pending.elapsed_ds = pending.elapsed_ds.saturating_add(passed_ds);
                    if pending.elapsed_ds >= pending.timeout_ds {
                        let addr = pending.target;
                        inner.endpoints[i]
                            .events
                            .push_back(BleEvent::ConnectingTimeout { addr });
                    } else {
                        inner.endpoints[i].pending_connect = Some(pending);
                    }
                }
            }
        }

        // Advertising reports to every scanning endpoint
        for scanner in 0..inner.endpoints.len() {
            if inner.endpoints[scanner].scanning.is_none() || inner.endpoints[scanner].unreachable {
                continue;
            }
            let mut reports = Vec::new();
            for (adv, e) in inner.endpoints.iter().enumerate() {
                if adv == scanner || e.unreachable {
                    continue;
                }
                if let Some((_, adv_data, _)) = &e.advertising {
                    reports.push(BleEvent::AdvReport {
                        addr: e.addr,
                        rssi: e.rssi,
                        data: adv_data.clone(),
                    });
                }
            }
            inner.endpoints[scanner].events.extend(reports);
        }

        // Deliver queued writes; the receiving side sees a write or a
        // notification depending on its role on the link
        for l in 0..inner.links.len() {
            let Some(link) = inner.links[l].as_mut() else {
                continue;
            };
            let deliveries: Vec<_> = link.pending.drain(..).collect();
            let central = link.sides[0].0;
            for (dst, dst_handle, src, src_handle, characteristic, data) in deliveries {
                let rx = if dst == central {
                    BleEvent::NotificationRx {
                        conn: dst_handle,
                        characteristic,
                        data,
                    }
                } else {
                    BleEvent::WriteRx {
                        conn: dst_handle,
                        characteristic,
                        data,
                    }
                };
                inner.endpoints[dst].events.push_back(rx);
                inner.endpoints[src].events.push_back(BleEvent::TxComplete {
                    conn: src_handle,
                    count: 1,
                });
            }
        }
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint's radio handle, implements the platform contract
pub struct LoopbackBle {
    inner: Rc<RefCell<FabricInner>>,
    index: usize,
}

impl LoopbackBle {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl BlePlatform for LoopbackBle {
    fn start_advertising(
        &mut self,
        params: AdvParams,
        adv_data: &[u8],
        scan_data: &[u8],
    ) -> Result<(), BleError> {
        if adv_data.len() > 31 || scan_data.len() > 31 {
            return Err(BleError::InvalidParam);
        }
        let mut inner = self.inner.borrow_mut();
        inner.endpoints[self.index].advertising =
            Some((params, adv_data.to_vec(), scan_data.to_vec()));
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), BleError> {
        self.inner.borrow_mut().endpoints[self.index].advertising = None;
        Ok(())
    }

    fn start_scanning(&mut self, params: ScanParams) -> Result<(), BleError> {
        if params.window_units > params.interval_units {
            return Err(BleError::InvalidParam);
        }
        self.inner.borrow_mut().endpoints[self.index].scanning = Some(params);
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), BleError> {
        self.inner.borrow_mut().endpoints[self.index].scanning = None;
        Ok(())
    }

    fn connect(&mut self, addr: BleGapAddr, timeout_ds: u16) -> Result<(), BleError> {
        let mut inner = self.inner.borrow_mut();
        let endpoint = &mut inner.endpoints[self.index];
        if endpoint.pending_connect.is_some() {
            return Err(BleError::Busy);
        }
        endpoint.pending_connect = Some(PendingConnect {
            target: addr,
            timeout_ds,
            elapsed_ds: 0,
        });
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnHandle, _reason: HciReason) -> Result<(), BleError> {
        let mut inner = self.inner.borrow_mut();
        match inner.link_by_handle(self.index, conn) {
            Some(idx) => {
                inner.teardown_link(idx, Some(self.index), HciReason::LOCAL_HOST_TERMINATED);
                Ok(())
            }
            None => Err(BleError::UnknownConnection),
        }
    }

    fn gatt_write(
        &mut self,
        conn: ConnHandle,
        characteristic: u16,
        data: &[u8],
        _reliable: bool,
    ) -> Result<(), BleError> {
        let mut inner = self.inner.borrow_mut();
        if inner.endpoints[self.index].fail_writes > 0 {
            inner.endpoints[self.index].fail_writes -= 1;
            return Err(BleError::GattWriteFailed);
        }
        let Some(idx) = inner.link_by_handle(self.index, conn) else {
            return Err(BleError::UnknownConnection);
        };
        let link = inner.links[idx].as_mut().unwrap();
        if data.len() > link.mtu as usize {
            return Err(BleError::InvalidParam);
        }
        let own_side = link.side_of(self.index).unwrap();
        let (dst, dst_handle) = link.sides[1 - own_side];
        let src_handle = link.handle_of(self.index).unwrap();
        link.pending
            .push_back((dst, dst_handle, self.index, src_handle, characteristic, data.to_vec()));
        Ok(())
    }

    fn set_tx_power(&mut self, _dbm: i8) -> Result<(), BleError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> BleGapAddr {
        BleGapAddr::new([n, 0, 0, 0, 0, 1])
    }

    fn adv_params() -> AdvParams {
        AdvParams {
            interval_units: 160,
            adv_type: AdvType::ConnectableUndirected,
        }
    }

    #[test]
    fn test_scan_sees_advertiser() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint(addr(1));
        let mut b = fabric.endpoint(addr(2));

        a.start_advertising(adv_params(), &[1, 2, 3], &[]).unwrap();
        b.start_scanning(ScanParams {
            interval_units: 160,
            window_units: 80,
        })
        .unwrap();

        fabric.tick(1);
        assert!(fabric.take_event(0).is_none());
        match fabric.take_event(1) {
            Some(BleEvent::AdvReport { addr: from, data, .. }) => {
                assert_eq!(from, addr(1));
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_connect_and_write_roundtrip() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint(addr(1));
        let mut b = fabric.endpoint(addr(2));

        b.start_advertising(adv_params(), &[0], &[]).unwrap();
        a.connect(addr(2), 20).unwrap();
        fabric.tick(1);

        let conn_a = match fabric.take_event(0) {
            Some(BleEvent::Connected { conn, role, .. }) => {
                assert_eq!(role, ConnRole::Central);
                conn
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert!(matches!(
            fabric.take_event(1),
            Some(BleEvent::Connected {
                role: ConnRole::Peripheral,
                ..
            })
        ));

        a.gatt_write(conn_a, 0x12, &[9, 9], true).unwrap();
        fabric.tick(1);

        assert!(matches!(
            fabric.take_event(1),
            Some(BleEvent::WriteRx { data, .. }) if data == vec![9, 9]
        ));
        assert!(matches!(
            fabric.take_event(0),
            Some(BleEvent::TxComplete { count: 1, .. })
        ));
    }

    #[test]
    fn test_connect_timeout_when_target_silent() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint(addr(1));
        let _b = fabric.endpoint(addr(2));

        a.connect(addr(2), 3).unwrap();
        fabric.tick(1);
        fabric.tick(1);
        assert!(fabric.take_event(0).is_none());
        fabric.tick(1);
        assert!(matches!(
            fabric.take_event(0),
            Some(BleEvent::ConnectingTimeout { .. })
        ));
    }

    #[test]
    fn test_injected_write_failure() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint(addr(1));
        let mut b = fabric.endpoint(addr(2));

        b.start_advertising(adv_params(), &[0], &[]).unwrap();
        a.connect(addr(2), 20).unwrap();
        fabric.tick(1);
        let conn_a = match fabric.take_event(0) {
            Some(BleEvent::Connected { conn, .. }) => conn,
            other => panic!("unexpected event {:?}", other),
        };

        fabric.fail_writes(0, 1);
        assert_eq!(
            a.gatt_write(conn_a, 0x12, &[1], true),
            Err(BleError::GattWriteFailed)
        );
        assert!(a.gatt_write(conn_a, 0x12, &[1], true).is_ok());
    }

    #[test]
    fn test_drop_link_reports_timeout_reason() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.endpoint(addr(1));
        let mut b = fabric.endpoint(addr(2));

        b.start_advertising(adv_params(), &[0], &[]).unwrap();
        a.connect(addr(2), 20).unwrap();
        fabric.tick(1);
        fabric.take_event(0);
        fabric.take_event(1);

        assert!(fabric.drop_link(0, 1));
        assert_eq!(fabric.link_count(), 0);
        assert!(matches!(
            fabric.take_event(0),
            Some(BleEvent::Disconnected { reason, .. }) if reason.is_link_loss()
        ));
        assert!(matches!(
            fabric.take_event(1),
            Some(BleEvent::Disconnected { reason, .. }) if reason.is_link_loss()
        ));
    }
}
