//! Forwarding of HAL property-change callbacks to caller-owned threads.
//!
//! The provider calls back on its own threads. Those callbacks only look up
//! the fan-out list and push [`ChangeEvent`]s onto a queue; caller callbacks
//! run when the queue is drained, either by [`NotificationBridge::drain_events`]
//! or by the async [`NotificationBridge::run`] loop.

use crate::address::{DeviceId, PropertyAddress};
use crate::error::{HalError, HalResult};
use crate::mutex::lock;
use crate::options::HalOptions;
use crate::provider::{HalProvider, ListenerFn, ListenerToken};
use crate::session::provider_error;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;
use tokio::sync::Notify;

pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub device: DeviceId,
    pub address: PropertyAddress,
    pub observed_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

type Key = (DeviceId, PropertyAddress);

struct Registration {
    handle: SubscriptionHandle,
    callback: EventCallback,
    count: usize,
}

struct Subscription {
    // `None` while the provider listener is being registered.
    token: Option<ListenerToken>,
    callbacks: Vec<Registration>,
}

#[derive(Default)]
struct Table {
    subscriptions: HashMap<Key, Subscription>,
    handles: HashMap<SubscriptionHandle, Key>,
}

struct Pending {
    event: ChangeEvent,
    handle: SubscriptionHandle,
    callback: EventCallback,
}

struct Shared {
    table: Mutex<Table>,
    queue: Mutex<VecDeque<Pending>>,
    wake: Notify,
    closed: AtomicBool,
    queue_limit: usize,
}

impl Shared {
    /// Runs on the provider's thread.
    fn enqueue(&self, key: Key) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let targets: Vec<(SubscriptionHandle, EventCallback)> = {
            let table = lock(&self.table);
            match table.subscriptions.get(&key) {
                Some(subscription) => subscription
                    .callbacks
                    .iter()
                    .map(|r| (r.handle, r.callback.clone()))
                    .collect(),
                None => return,
            }
        };
        let observed_at = SystemTime::now();
        {
            let mut queue = lock(&self.queue);
            for (handle, callback) in targets {
                if queue.len() >= self.queue_limit.max(1) {
                    queue.pop_front();
                    tracing::warn!(
                        "change event queue full ({} pending), dropping oldest",
                        self.queue_limit
                    );
                }
                queue.push_back(Pending {
                    event: ChangeEvent {
                        device: key.0,
                        address: key.1,
                        observed_at,
                    },
                    handle,
                    callback,
                });
            }
        }
        tracing::trace!("queued change of {} on device {}", key.1, key.0);
        self.wake.notify_one();
    }
}

fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// One provider listener per (device, address), fanned out to any number of
/// caller callbacks.
pub struct NotificationBridge {
    provider: Arc<dyn HalProvider>,
    shared: Arc<Shared>,
    // Serializes subscribe, unsubscribe and shutdown so provider calls can
    // happen outside the table lock.
    ops: Mutex<()>,
    next_handle: AtomicU64,
}

impl NotificationBridge {
    pub fn new(provider: Arc<dyn HalProvider>) -> Self {
        Self::with_options(provider, &HalOptions::default())
    }

    pub fn with_options(provider: Arc<dyn HalProvider>, options: &HalOptions) -> Self {
        Self {
            provider,
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                queue_limit: options.event_queue_limit,
            }),
            ops: Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Register `callback` for changes of `address` on `device`.
    ///
    /// Subscribing a callback that is already registered for the same key
    /// returns its existing handle and bumps its count. Each count needs its
    /// own [`NotificationBridge::unsubscribe`].
    pub fn subscribe(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        callback: EventCallback,
    ) -> HalResult<SubscriptionHandle> {
        if device.is_unknown() {
            return Err(HalError::UnknownDevice(device));
        }
        let _ops = lock(&self.ops);
        if self.is_closed() {
            return Err(HalError::BridgeClosed);
        }
        let key = (device, address);

        {
            let mut guard = lock(&self.shared.table);
            let table = &mut *guard;
            if let Some(subscription) = table.subscriptions.get_mut(&key) {
                if let Some(existing) = subscription
                    .callbacks
                    .iter_mut()
                    .find(|r| same_callback(&r.callback, &callback))
                {
                    existing.count += 1;
                    return Ok(existing.handle);
                }
                let handle = self.next_handle();
                subscription.callbacks.push(Registration {
                    handle,
                    callback,
                    count: 1,
                });
                table.handles.insert(handle, key);
                return Ok(handle);
            }
        }

        // The entry goes in first so an event fired while the provider is
        // still registering the listener finds its callbacks.
        let handle = self.next_handle();
        {
            let mut table = lock(&self.shared.table);
            table.subscriptions.insert(
                key,
                Subscription {
                    token: None,
                    callbacks: vec![Registration {
                        handle,
                        callback,
                        count: 1,
                    }],
                },
            );
            table.handles.insert(handle, key);
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let listener: ListenerFn = Arc::new(move |_: DeviceId, _: &[PropertyAddress]| {
            if let Some(shared) = shared.upgrade() {
                shared.enqueue(key);
            }
        });
        match self.provider.register_listener(device, &address, listener) {
            Ok(token) => {
                if let Some(subscription) = lock(&self.shared.table).subscriptions.get_mut(&key) {
                    subscription.token = Some(token);
                }
                tracing::debug!("listening for {address} on device {device}");
                Ok(handle)
            }
            Err(e) => {
                {
                    let mut table = lock(&self.shared.table);
                    table.subscriptions.remove(&key);
                    table.handles.remove(&handle);
                }
                lock(&self.shared.queue).retain(|pending| pending.handle != handle);
                Err(provider_error(e, device, &address, "listener registration"))
            }
        }
    }

    fn next_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    /// Drop one registration. The provider listener goes away with the last
    /// callback of its key.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> HalResult<()> {
        let _ops = lock(&self.ops);
        let released = {
            let mut guard = lock(&self.shared.table);
            let table = &mut *guard;
            let key = *table
                .handles
                .get(&handle)
                .ok_or(HalError::UnknownSubscription(handle.0))?;
            let subscription = table
                .subscriptions
                .get_mut(&key)
                .ok_or(HalError::UnknownSubscription(handle.0))?;
            let position = subscription
                .callbacks
                .iter()
                .position(|r| r.handle == handle)
                .ok_or(HalError::UnknownSubscription(handle.0))?;

            subscription.callbacks[position].count -= 1;
            if subscription.callbacks[position].count > 0 {
                return Ok(());
            }
            subscription.callbacks.remove(position);
            table.handles.remove(&handle);
            if !subscription.callbacks.is_empty() {
                return Ok(());
            }
            table
                .subscriptions
                .remove(&key)
                .and_then(|s| s.token.map(|token| (key, token)))
        };

        if let Some(((device, address), token)) = released {
            self.provider
                .deregister_listener(token)
                .map_err(|e| provider_error(e, device, &address, "listener removal"))?;
            tracing::debug!("stopped listening for {address} on device {device}");
        }
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.table).handles.len()
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Deliver everything queued so far on the calling thread.
    ///
    /// Returns the number of callbacks invoked. Events whose registration was
    /// removed after they were queued are skipped.
    pub fn drain_events(&self) -> usize {
        let pending: Vec<Pending> = lock(&self.shared.queue).drain(..).collect();
        let mut delivered = 0;
        for item in pending {
            let live = lock(&self.shared.table).handles.contains_key(&item.handle);
            if !live {
                continue;
            }
            (item.callback)(&item.event);
            delivered += 1;
        }
        delivered
    }

    /// Dispatch loop. Drains on every wake-up until [`NotificationBridge::shutdown`].
    pub async fn run(&self) {
        while !self.is_closed() {
            self.drain_events();
            self.shared.wake.notified().await;
        }
    }

    /// Deregister every provider listener, then clear the table and queue.
    pub fn shutdown(&self) {
        let _ops = lock(&self.ops);
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tokens: Vec<(Key, ListenerToken)> = lock(&self.shared.table)
            .subscriptions
            .iter()
            .filter_map(|(key, s)| s.token.map(|token| (*key, token)))
            .collect();
        for ((device, address), token) in &tokens {
            if let Err(e) = self.provider.deregister_listener(*token) {
                tracing::warn!("failed to remove listener for {address} on device {device}: {e}");
            }
        }
        {
            let mut table = lock(&self.shared.table);
            table.subscriptions.clear();
            table.handles.clear();
        }
        lock(&self.shared.queue).clear();
        self.shared.wake.notify_one();
        tracing::debug!("notification bridge closed, {} listeners removed", tokens.len());
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, ProviderError};
    use crate::selector::{DEVICES_ADDRESS, OUTPUT_VOLUME_ADDRESS, SAMPLE_RATE_ADDRESS};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SPEAKERS: DeviceId = DeviceId(73);

    fn bridge_with_limit(limit: usize) -> (Arc<MemoryProvider>, NotificationBridge) {
        let provider = Arc::new(MemoryProvider::demo());
        let options = HalOptions {
            event_queue_limit: limit,
            ..HalOptions::default()
        };
        let bridge = NotificationBridge::with_options(provider.clone(), &options);
        (provider, bridge)
    }

    fn bridge() -> (Arc<MemoryProvider>, NotificationBridge) {
        bridge_with_limit(HalOptions::default().event_queue_limit)
    }

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        let callback: EventCallback = Arc::new(move |_: &ChangeEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn one_provider_listener_per_key() {
        let (provider, bridge) = bridge();
        let (a_hits, a) = counter();
        let (b_hits, b) = counter();
        let ha = bridge.subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, a).unwrap();
        let hb = bridge.subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, b).unwrap();
        assert_ne!(ha, hb);
        assert_eq!(provider.listener_count(), 1);

        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        assert_eq!(bridge.pending_events(), 2);
        assert_eq!(bridge.drain_events(), 2);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_callback_twice_needs_two_unsubscribes() {
        let (provider, bridge) = bridge();
        let (hits, callback) = counter();
        let first = bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback.clone())
            .unwrap();
        let second = bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback)
            .unwrap();
        assert_eq!(first, second);

        bridge.unsubscribe(first).unwrap();
        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        assert_eq!(bridge.drain_events(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bridge.unsubscribe(first).unwrap();
        assert_eq!(provider.listener_count(), 0);
        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        assert_eq!(bridge.drain_events(), 0);
        assert_eq!(
            bridge.unsubscribe(first),
            Err(HalError::UnknownSubscription(first.id()))
        );
    }

    #[test]
    fn callbacks_run_on_the_draining_thread() {
        let (provider, bridge) = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bridge
            .subscribe(
                SPEAKERS,
                SAMPLE_RATE_ADDRESS,
                Arc::new(move |_: &ChangeEvent| {
                    sink.lock().unwrap().push(std::thread::current().id());
                }),
            )
            .unwrap();

        let remote = provider.clone();
        std::thread::spawn(move || remote.notify(SPEAKERS, SAMPLE_RATE_ADDRESS))
            .join()
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(bridge.drain_events(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![std::thread::current().id()]);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (provider, bridge) = bridge_with_limit(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EventCallback = Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.address.element);
        });
        for element in 0..3 {
            bridge
                .subscribe(
                    SPEAKERS,
                    OUTPUT_VOLUME_ADDRESS.with_element(element),
                    callback.clone(),
                )
                .unwrap();
        }
        for element in 0..3 {
            provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS.with_element(element));
        }
        assert_eq!(bridge.drain_events(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unsubscribed_callbacks_miss_queued_events() {
        let (provider, bridge) = bridge();
        let (hits, callback) = counter();
        let (other_hits, other) = counter();
        let handle = bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback)
            .unwrap();
        bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, other)
            .unwrap();
        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        bridge.unsubscribe(handle).unwrap();

        assert_eq!(bridge.drain_events(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_deregisters_everything() {
        let (provider, bridge) = bridge();
        let (hits, callback) = counter();
        bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback.clone())
            .unwrap();
        bridge
            .subscribe(DeviceId::SYSTEM, DEVICES_ADDRESS, callback.clone())
            .unwrap();
        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        assert_eq!(provider.listener_count(), 2);

        bridge.shutdown();
        assert_eq!(provider.listener_count(), 0);
        assert_eq!(bridge.pending_events(), 0);
        assert_eq!(bridge.subscription_count(), 0);

        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        assert_eq!(bridge.drain_events(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(
            bridge.subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback),
            Err(HalError::BridgeClosed)
        );
    }

    #[test]
    fn drop_deregisters_listeners() {
        let (provider, bridge) = bridge();
        let (_, callback) = counter();
        bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback)
            .unwrap();
        drop(bridge);
        assert_eq!(provider.listener_count(), 0);
    }

    /// Fires every newly registered listener from another thread before
    /// `register_listener` returns.
    struct EagerProvider(Arc<MemoryProvider>);

    impl HalProvider for EagerProvider {
        fn has_property(&self, object: DeviceId, address: &PropertyAddress) -> bool {
            self.0.has_property(object, address)
        }

        fn query_size(
            &self,
            object: DeviceId,
            address: &PropertyAddress,
        ) -> Result<usize, ProviderError> {
            self.0.query_size(object, address)
        }

        fn read_bytes(
            &self,
            object: DeviceId,
            address: &PropertyAddress,
            buf: &mut [u8],
        ) -> Result<usize, ProviderError> {
            self.0.read_bytes(object, address, buf)
        }

        fn write_bytes(
            &self,
            object: DeviceId,
            address: &PropertyAddress,
            data: &[u8],
        ) -> Result<(), ProviderError> {
            self.0.write_bytes(object, address, data)
        }

        fn is_settable(
            &self,
            object: DeviceId,
            address: &PropertyAddress,
        ) -> Result<bool, ProviderError> {
            self.0.is_settable(object, address)
        }

        fn register_listener(
            &self,
            object: DeviceId,
            address: &PropertyAddress,
            listener: ListenerFn,
        ) -> Result<ListenerToken, ProviderError> {
            let token = self.0.register_listener(object, address, listener)?;
            let inner = self.0.clone();
            let address = *address;
            std::thread::spawn(move || inner.notify(object, address))
                .join()
                .unwrap();
            Ok(token)
        }

        fn deregister_listener(&self, token: ListenerToken) -> Result<(), ProviderError> {
            self.0.deregister_listener(token)
        }
    }

    #[test]
    fn event_during_registration_is_delivered() {
        let memory = Arc::new(MemoryProvider::demo());
        let bridge = NotificationBridge::new(Arc::new(EagerProvider(memory.clone())));
        let (hits, callback) = counter();
        bridge
            .subscribe(SPEAKERS, OUTPUT_VOLUME_ADDRESS, callback)
            .unwrap();
        assert_eq!(bridge.drain_events(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(memory.listener_count(), 1);
    }

    #[test]
    fn failed_registration_leaves_no_entry() {
        let (provider, bridge) = bridge();
        let (_, callback) = counter();
        assert!(matches!(
            bridge.subscribe(DeviceId(999), OUTPUT_VOLUME_ADDRESS, callback),
            Err(HalError::UnknownDevice(_))
        ));
        assert_eq!(bridge.subscription_count(), 0);
        assert_eq!(provider.listener_count(), 0);
    }

    #[test]
    fn unknown_device_sentinel_is_refused() {
        let (provider, bridge) = bridge();
        let (_, callback) = counter();
        assert_eq!(
            bridge.subscribe(DeviceId::UNKNOWN, OUTPUT_VOLUME_ADDRESS, callback),
            Err(HalError::UnknownDevice(DeviceId::UNKNOWN))
        );
        assert_eq!(provider.listener_count(), 0);
    }

    #[tokio::test]
    async fn run_dispatches_until_shutdown() {
        let (provider, bridge) = bridge();
        let bridge = Arc::new(bridge);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bridge
            .subscribe(
                SPEAKERS,
                OUTPUT_VOLUME_ADDRESS,
                Arc::new(move |event: &ChangeEvent| {
                    let _ = tx.send(event.device);
                }),
            )
            .unwrap();

        let dispatcher = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.run().await })
        };
        provider.notify(SPEAKERS, OUTPUT_VOLUME_ADDRESS);
        let device = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event delivered")
            .expect("channel open");
        assert_eq!(device, SPEAKERS);

        bridge.shutdown();
        tokio::time::timeout(Duration::from_secs(5), dispatcher)
            .await
            .expect("dispatcher stopped")
            .unwrap();
    }
}
