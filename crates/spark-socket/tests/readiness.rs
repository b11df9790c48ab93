//! 聚合器在一轮迭代内对所有消费者给出同一份快照，并正确处理描述符复用。

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use spark_socket::{Descriptor, Monitor, Phase, ReadinessAggregator, ReadinessQuery};

/// 可在测试中途改变“哪些描述符有数据”的替身查询。
#[derive(Clone, Default)]
struct SharedQuery {
    readable: Rc<RefCell<BTreeSet<Descriptor>>>,
    seen: Rc<RefCell<Vec<Vec<Descriptor>>>>,
}

impl ReadinessQuery for SharedQuery {
    fn query(
        &mut self,
        descriptors: &[Descriptor],
        readable: &mut [bool],
        _timeout: Duration,
    ) -> io::Result<()> {
        self.seen.borrow_mut().push(descriptors.to_vec());
        let data = self.readable.borrow();
        for (fd, slot) in descriptors.iter().zip(readable.iter_mut()) {
            *slot = data.contains(fd);
        }
        Ok(())
    }
}

#[test]
fn consumers_share_one_snapshot_per_iteration() {
    let query = SharedQuery::default();
    let mut aggregator = ReadinessAggregator::new(query.clone());
    let mut first = Monitor::new(aggregator.handle());
    let mut second = Monitor::new(aggregator.handle());
    assert!(first.register(3));
    assert!(second.register(4));

    query.readable.borrow_mut().insert(3);
    let report = aggregator.refresh();
    assert_eq!(report.queried, 2);
    assert_eq!(report.ready, 1);

    // 数据在本轮中途到达 4，但快照保持不变。
    query.readable.borrow_mut().insert(4);
    assert!(first.ready());
    assert!(!second.ready());
    assert!(!second.ready());
    aggregator.finish_iteration();
    assert_eq!(aggregator.phase(), Phase::Idle);

    aggregator.refresh();
    assert!(second.ready());
    assert_eq!(query.seen.borrow().len(), 2);
}

#[test]
fn socket_closed_before_refresh_is_not_queried() {
    let query = SharedQuery::default();
    let mut aggregator = ReadinessAggregator::new(query.clone());
    let mut kept = Monitor::new(aggregator.handle());
    let mut closed = Monitor::new(aggregator.handle());
    kept.register(7);
    closed.register(8);
    closed.release();

    aggregator.refresh();
    assert_eq!(query.seen.borrow().last().cloned(), Some(vec![7]));
    assert_eq!(aggregator.registered(), 1);
}

#[test]
fn reused_descriptor_does_not_inherit_previous_readiness() {
    let query = SharedQuery::default();
    let mut aggregator = ReadinessAggregator::new(query.clone());
    query.readable.borrow_mut().insert(5);

    let mut old = Monitor::new(aggregator.handle());
    old.register(5);
    aggregator.refresh();
    assert!(old.ready());
    let old_epoch = old.epoch();

    // 旧套接字关闭，描述符 5 立即被新套接字复用。
    drop(old);
    let mut reused = Monitor::new(aggregator.handle());
    assert!(reused.register(5));
    assert!(reused.epoch() > old_epoch);
    assert!(!reused.ready());
    assert!(!aggregator.is_ready(5));

    aggregator.refresh();
    assert!(reused.ready());
}

#[test]
fn unmonitored_sockets_always_look_ready() {
    let mut monitor = Monitor::unmonitored();
    assert!(monitor.ready());
    assert!(!monitor.register(1));
    assert!(!monitor.is_registered());
}
