//! 就绪聚合器：每轮主循环一次多路查询，缓存结果供所有套接字读取。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 逐个套接字探测“是否有数据”会让每轮迭代产生 N 次系统调用；聚合器把它们合并为
//!   **一次**多路查询（`poll`/`select`/引擎服务），其余 `ready()` 调用只读缓存。
//! - 聚合器是主循环显式持有的对象，套接字通过 [`RegistryHandle`] 弱引用它，
//!   不存在进程级单例。
//!
//! ## 逻辑（How）
//! - 登记集合以描述符为键保存 `Slot { epoch, state }`；每次登记分配一个单调递增的
//!   epoch，只有持有当前 epoch 的 [`Registration`] 才能读到或注销该条目；
//! - [`Registration`] 是 RAII 句柄：被丢弃时同步注销条目，早于描述符被关闭；
//! - [`ReadinessAggregator::refresh`] 先在借用内收集 `(fd, epoch)` 快照并释放借用，
//!   再执行查询，最后只回写 epoch 仍匹配的条目。查询期间被关闭、又被复用的描述符
//!   因 epoch 不同而不会继承旧结果。
//!
//! ## 契约（What）
//! - 状态机：`Idle → Queried`（`refresh`）`→ Idle`（`finish_iteration`）；
//! - 迭代中途新增的登记在下一次 `refresh` 之前报告“未就绪”；
//! - 迭代中途注销的条目立即失效；
//! - 查询失败不会传播：本轮所有已登记描述符都报告“就绪”，并记录一条 `warn!`。
//!
//! ## 风险提示（Trade-offs）
//! - 降级为“全部就绪”会让消费者多做一次读取并得到 `WouldBlock`，以此换取主循环不中断。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::socket::Descriptor;

/// 一次多路“哪些描述符有待读输入”查询。
///
/// 实现者必须在返回 `Ok(())` 时为 `descriptors[i]` 写入 `readable[i]`；
/// 两个切片长度相同。`timeout` 为零表示纯探测，非零时允许在查询中休眠直到
/// 任一描述符可读或超时。
pub trait ReadinessQuery {
    fn query(
        &mut self,
        descriptors: &[Descriptor],
        readable: &mut [bool],
        timeout: Duration,
    ) -> io::Result<()>;
}

/// 聚合器所处阶段。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// 本轮尚未查询。
    #[default]
    Idle,
    /// 本轮查询已完成，结果已缓存。
    Queried,
}

/// 一次 `refresh` 的摘要。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationReport {
    /// 迭代序号，从 1 开始。
    pub iteration: u64,
    /// 参与查询的描述符数量。
    pub queried: usize,
    /// 被标记为就绪的描述符数量。
    pub ready: usize,
    /// 查询是否失败并降级为“全部就绪”。
    pub degraded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Pending,
    Known(bool),
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    epoch: u64,
    state: SlotState,
}

/// 登记集合：描述符 → 最近一次已知就绪状态。
#[derive(Debug, Default)]
struct Registry {
    slots: BTreeMap<Descriptor, Slot>,
    next_epoch: u64,
    iteration: u64,
    phase: Phase,
}

impl Registry {
    fn register(&mut self, fd: Descriptor) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let slot = Slot {
            epoch,
            state: SlotState::Pending,
        };
        if let Some(stale) = self.slots.insert(fd, slot) {
            debug!(fd, stale_epoch = stale.epoch, epoch, "replaced stale readiness registration");
        } else {
            debug!(fd, epoch, "registered for readiness monitoring");
        }
        epoch
    }

    fn deregister(&mut self, fd: Descriptor, epoch: u64) -> bool {
        match self.slots.get(&fd) {
            Some(slot) if slot.epoch == epoch => {
                self.slots.remove(&fd);
                debug!(fd, epoch, "deregistered from readiness monitoring");
                true
            }
            _ => false,
        }
    }

    fn state(&self, fd: Descriptor, epoch: u64) -> Option<SlotState> {
        self.slots
            .get(&fd)
            .filter(|slot| slot.epoch == epoch)
            .map(|slot| slot.state)
    }

    fn snapshot(&self) -> Vec<(Descriptor, u64)> {
        self.slots
            .iter()
            .map(|(fd, slot)| (*fd, slot.epoch))
            .collect()
    }

    fn store(&mut self, fd: Descriptor, epoch: u64, readable: bool) -> bool {
        match self.slots.get_mut(&fd) {
            Some(slot) if slot.epoch == epoch => {
                slot.state = SlotState::Known(readable);
                true
            }
            _ => false,
        }
    }
}

/// 指向聚合器登记集合的弱句柄，由工厂交给每个套接字。
#[derive(Clone, Default)]
pub struct RegistryHandle {
    registry: Weak<RefCell<Registry>>,
}

impl RegistryHandle {
    /// 不指向任何聚合器的句柄；经由它打开的套接字永远不被监控。
    pub fn detached() -> Self {
        Self::default()
    }

    /// 聚合器是否仍然存活。
    pub fn is_attached(&self) -> bool {
        self.registry.strong_count() > 0
    }

    /// 登记描述符；聚合器已销毁时返回 `None`。
    pub fn register(&self, fd: Descriptor) -> Option<Registration> {
        let registry = self.registry.upgrade()?;
        let epoch = registry.borrow_mut().register(fd);
        Some(Registration {
            registry: Rc::downgrade(&registry),
            fd,
            epoch,
        })
    }
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// 一条就绪登记的所有权凭证，丢弃即注销。
pub struct Registration {
    registry: Weak<RefCell<Registry>>,
    fd: Descriptor,
    epoch: u64,
}

impl Registration {
    pub fn descriptor(&self) -> Descriptor {
        self.fd
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 读取本轮缓存结果。
    ///
    /// 尚未被任何查询覆盖的新登记返回 `false`；聚合器已销毁或条目已不属于本凭证时
    /// 保守返回 `true`。
    pub fn is_ready(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return true;
        };
        let state = registry.borrow().state(self.fd, self.epoch);
        match state {
            Some(SlotState::Pending) => false,
            Some(SlotState::Known(readable)) => readable,
            None => true,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().deregister(self.fd, self.epoch);
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("fd", &self.fd)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// 套接字侧的监控状态：持有聚合器句柄与可选的登记凭证。
#[derive(Debug, Default)]
pub struct Monitor {
    handle: RegistryHandle,
    registration: Option<Registration>,
}

impl Monitor {
    /// 绑定到某个聚合器，但尚未登记。
    pub fn new(handle: RegistryHandle) -> Self {
        Self {
            handle,
            registration: None,
        }
    }

    /// 永不登记的监控状态。
    pub fn unmonitored() -> Self {
        Self::default()
    }

    /// 聚合器句柄副本，供 `accept` 派生的子套接字复用。
    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    /// 以描述符登记；已有登记会先被注销。
    pub fn register(&mut self, fd: Descriptor) -> bool {
        if self
            .registration
            .as_ref()
            .is_some_and(|registration| registration.descriptor() == fd)
        {
            return true;
        }
        self.registration = None;
        self.registration = self.handle.register(fd);
        self.registration.is_some()
    }

    /// 同步注销；必须在描述符关闭之前调用。
    pub fn release(&mut self) {
        self.registration = None;
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// 当前登记的 epoch。
    pub fn epoch(&self) -> Option<u64> {
        self.registration.as_ref().map(Registration::epoch)
    }

    /// 未登记时恒为 `true`。
    pub fn ready(&self) -> bool {
        self.registration
            .as_ref()
            .is_none_or(Registration::is_ready)
    }
}

/// 主循环持有的就绪聚合器。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 主循环在每轮迭代、任何组件运行之前调用一次 [`refresh`](Self::refresh)，且每次
///   `refresh` 只向查询实现发出**一次**调用；
/// - 同一轮内所有消费者看到同一份快照；
/// - [`is_ready`](Self::is_ready) 对未登记描述符返回 `false`。
#[derive(Debug)]
pub struct ReadinessAggregator<Q> {
    registry: Rc<RefCell<Registry>>,
    query: Q,
}

impl<Q: ReadinessQuery> ReadinessAggregator<Q> {
    pub fn new(query: Q) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry::default())),
            query,
        }
    }

    /// 交给套接字的弱句柄。
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// 零超时刷新。
    pub fn refresh(&mut self) -> IterationReport {
        self.refresh_with_timeout(Duration::ZERO)
    }

    /// 发起本轮唯一一次多路查询；`timeout` 允许主循环在查询中空闲等待。
    pub fn refresh_with_timeout(&mut self, timeout: Duration) -> IterationReport {
        let (iteration, entries) = {
            let mut registry = self.registry.borrow_mut();
            registry.iteration += 1;
            (registry.iteration, registry.snapshot())
        };
        let descriptors: Vec<Descriptor> = entries.iter().map(|(fd, _)| *fd).collect();
        let mut readable = vec![false; descriptors.len()];

        let outcome = self.query.query(&descriptors, &mut readable, timeout);

        let mut registry = self.registry.borrow_mut();
        let degraded = match outcome {
            Ok(()) => false,
            Err(error) => {
                warn!(
                    iteration,
                    queried = descriptors.len(),
                    error = %error,
                    "readiness query failed; reporting every monitored socket as ready"
                );
                readable.fill(true);
                true
            }
        };
        let mut ready = 0;
        for ((fd, epoch), readable) in entries.iter().zip(readable) {
            if registry.store(*fd, *epoch, readable) && readable {
                ready += 1;
            }
        }
        registry.phase = Phase::Queried;
        trace!(iteration, queried = descriptors.len(), ready, degraded, "readiness refreshed");
        IterationReport {
            iteration,
            queried: descriptors.len(),
            ready,
            degraded,
        }
    }

    /// 结束本轮迭代，回到 `Idle`；缓存结果保留到下一次查询。
    pub fn finish_iteration(&mut self) {
        self.registry.borrow_mut().phase = Phase::Idle;
    }

    pub fn phase(&self) -> Phase {
        self.registry.borrow().phase
    }

    /// 已完成的迭代数。
    pub fn iteration(&self) -> u64 {
        self.registry.borrow().iteration
    }

    /// 主循环代理给消费者的“描述符 D 是否就绪”。
    pub fn is_ready(&self, fd: Descriptor) -> bool {
        let registry = self.registry.borrow();
        matches!(
            registry.slots.get(&fd).map(|slot| slot.state),
            Some(SlotState::Known(true))
        )
    }

    pub fn is_registered(&self, fd: Descriptor) -> bool {
        self.registry.borrow().slots.contains_key(&fd)
    }

    /// 当前登记数量。
    pub fn registered(&self) -> usize {
        self.registry.borrow().slots.len()
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut Q {
        &mut self.query
    }
}
