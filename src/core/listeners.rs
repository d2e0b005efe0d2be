//! 监听器集合：注册、退订、隔离派发
//!
//! 单个监听器 panic 只记录日志，不影响同一通道里其余监听器，也不会卡住更新队列。

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// 监听回调
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// 一个通道上的监听器集合
pub struct ListenerSet<T> {
    channel: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> ListenerSet<T> {
    pub fn new(channel: &'static str) -> Self {
        Self {
            channel,
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Listener<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 派发给全部监听器，返回成功（未 panic）的个数
    pub fn notify(&self, value: &T) -> usize {
        self.deliver(value).iter().filter(|(_, ok)| *ok).count()
    }

    /// 派发给全部监听器，返回本次覆盖到的监听器 id（含 panic 的）
    pub fn notify_all(&self, value: &T) -> Vec<u64> {
        self.deliver(value).into_iter().map(|(id, _)| id).collect()
    }

    fn deliver(&self, value: &T) -> Vec<(u64, bool)> {
        // 先复制一份再释放锁：监听器内部可能再订阅 / 退订
        let snapshot: Vec<(u64, Listener<T>)> = self.lock().clone();
        snapshot
            .iter()
            .map(|(id, listener)| (*id, self.dispatch(*id, listener, value)))
            .collect()
    }

    /// 只派发给指定监听器（已退订则忽略）
    pub fn notify_one(&self, id: u64, value: &T) -> bool {
        let listener = self
            .lock()
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, l)| Arc::clone(l));
        match listener {
            Some(listener) => self.dispatch(id, &listener, value),
            None => false,
        }
    }

    fn dispatch(&self, id: u64, listener: &Listener<T>, value: &T) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (**listener)(value))) {
            Ok(()) => true,
            Err(payload) => {
                tracing::error!(
                    channel = self.channel,
                    listener_id = id,
                    "listener panicked: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 从 panic 载荷中取出文字描述
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// 订阅句柄：调用 unsubscribe 退订；直接丢弃句柄不会退订
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<T: 'static>(set: &Arc<ListenerSet<T>>, id: u64) -> Self {
        let weak: Weak<ListenerSet<T>> = Arc::downgrade(set);
        Self {
            cancel: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    set.remove(id);
                }
            })),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
