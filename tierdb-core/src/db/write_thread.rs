//! Group commit.
//!
//! Writers queue in arrival order. The writer at the head becomes the leader:
//! it folds the compatible writers queued behind it into one group, writes
//! the group to the WAL and memtables on their behalf, then hands every
//! member its result and passes leadership to the next queued writer.

use super::WriteBatch;
use crate::config::{MAX_WRITE_GROUP_BYTES, SMALL_WRITE_GROUP_SLACK};
use crate::{Result, TierError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One queued request
pub(crate) struct Writer {
    id: u64,
    /// `None` for exclusive work (memtable switch for a flush) that must not be grouped
    pub batch: Option<WriteBatch>,
    pub sync: bool,
    pub disable_wal: bool,
    pub deadline: Option<Instant>,
}

impl Writer {
    fn batch_size(&self) -> usize {
        self.batch.as_ref().map_or(0, |b| b.approximate_size())
    }
}

enum Slot {
    Queued,
    /// Folded into a leader's group; the leader will report back
    InGroup,
    Done(Result<()>),
}

#[derive(Default)]
struct WriteQueue {
    order: VecDeque<u64>,
    writers: HashMap<u64, (Arc<Writer>, Slot)>,
}

/// What a writer learns when it leaves [`WriteThread::join`]
pub(crate) enum Joined {
    /// This writer leads; it must call [`WriteThread::exit`]
    Leader,
    /// Another leader finished (or the deadline passed); here is the result
    Done(Result<()>),
}

pub(crate) struct WriteThread {
    queue: Mutex<WriteQueue>,
    cv: Condvar,
    next_id: AtomicU64,
}

impl WriteThread {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(WriteQueue::default()),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn new_writer(
        &self,
        batch: Option<WriteBatch>,
        sync: bool,
        disable_wal: bool,
        timeout: Option<Duration>,
    ) -> Arc<Writer> {
        Arc::new(Writer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            batch,
            sync,
            disable_wal,
            deadline: timeout.map(|t| Instant::now() + t),
        })
    }

    /// Queue `writer` and block until it leads or has been served.
    ///
    /// A writer still waiting in the queue when its deadline passes is taken
    /// out and gets `Timeout`; the writers around it are unaffected.
    pub fn join(&self, writer: &Arc<Writer>) -> Joined {
        let id = writer.id;
        let mut queue = self.queue.lock();
        queue.order.push_back(id);
        queue.writers.insert(id, (Arc::clone(writer), Slot::Queued));

        loop {
            let at_head = queue.order.front() == Some(&id);
            match queue.writers.get(&id).map(|(_, slot)| slot) {
                Some(Slot::Done(_)) => {
                    if let Some((_, Slot::Done(result))) = queue.writers.remove(&id) {
                        return Joined::Done(result);
                    }
                }
                Some(Slot::Queued) if at_head => return Joined::Leader,
                Some(Slot::Queued) => {
                    if let Some(deadline) = writer.deadline {
                        if Instant::now() >= deadline {
                            queue.order.retain(|w| *w != id);
                            queue.writers.remove(&id);
                            self.cv.notify_all();
                            return Joined::Done(Err(TierError::Timeout));
                        }
                        self.cv.wait_until(&mut queue, deadline);
                        continue;
                    }
                }
                Some(Slot::InGroup) => {}
                None => {
                    return Joined::Done(Err(TierError::Internal(format!(
                        "writer {} vanished from the write queue",
                        id
                    ))))
                }
            }
            self.cv.wait(&mut queue);
        }
    }

    /// Fold compatible writers queued behind `leader` into its group.
    ///
    /// The group stops at the first writer that cannot join: an exclusive
    /// writer, a sync writer behind a non-sync leader, a different WAL
    /// setting, a tighter deadline, or one that would exceed the size limit.
    /// The leader is always the first member.
    pub fn build_group(&self, leader: &Arc<Writer>) -> Vec<Arc<Writer>> {
        let mut group = vec![Arc::clone(leader)];
        if leader.batch.is_none() {
            return group;
        }

        let mut size = leader.batch_size();
        let max_size = if size <= SMALL_WRITE_GROUP_SLACK {
            size + SMALL_WRITE_GROUP_SLACK
        } else {
            MAX_WRITE_GROUP_BYTES
        };

        let mut queue = self.queue.lock();
        let candidates: Vec<u64> = queue.order.iter().skip(1).copied().collect();
        for id in candidates {
            let Some((writer, slot)) = queue.writers.get_mut(&id) else {
                break;
            };
            if writer.batch.is_none()
                || (writer.sync && !leader.sync)
                || writer.disable_wal != leader.disable_wal
            {
                break;
            }
            if let Some(deadline) = writer.deadline {
                if leader.deadline.map_or(true, |d| deadline < d) {
                    break;
                }
            }
            size += writer.batch_size();
            if size > max_size {
                break;
            }
            *slot = Slot::InGroup;
            group.push(Arc::clone(writer));
        }
        group
    }

    /// Report `result` to every member of the group and hand leadership on.
    ///
    /// Returns the leader's own result.
    pub fn exit(&self, group: &[Arc<Writer>], result: Result<()>) -> Result<()> {
        let mut queue = self.queue.lock();
        for (i, writer) in group.iter().enumerate() {
            queue.order.retain(|w| *w != writer.id);
            if i == 0 {
                queue.writers.remove(&writer.id);
            } else if let Some((_, slot)) = queue.writers.get_mut(&writer.id) {
                *slot = Slot::Done(match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.duplicate()),
                });
            }
        }
        self.cv.notify_all();
        result
    }

    /// Writers currently queued, leader included
    pub fn queue_len(&self) -> usize {
        self.queue.lock().order.len()
    }
}

/// Delay for a write arriving while `n` level-0 files are waiting.
///
/// Zero below `slowdown`, one millisecond at or beyond `stop`, and a
/// quadratic ramp (at least 100µs) in between.
pub fn slowdown_amount(n: usize, slowdown: usize, stop: usize) -> Duration {
    let micros = if n >= stop {
        1000
    } else if n < slowdown {
        0
    } else {
        let how_much = (n - slowdown) as f64 / (stop - slowdown) as f64;
        (how_much * how_much * 1000.0).max(100.0) as u64
    };
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn batch(size: usize) -> WriteBatch {
        let mut b = WriteBatch::new();
        b.put(b"k", &vec![0u8; size]);
        b
    }

    #[test]
    fn test_slowdown_amount() {
        assert_eq!(slowdown_amount(3, 8, 12), Duration::ZERO);
        assert_eq!(slowdown_amount(12, 8, 12), Duration::from_micros(1000));
        assert_eq!(slowdown_amount(20, 8, 12), Duration::from_micros(1000));
        // the ramp starts at the floor
        assert_eq!(slowdown_amount(8, 8, 12), Duration::from_micros(100));
        assert_eq!(slowdown_amount(11, 8, 12), Duration::from_micros(562));
        assert!(slowdown_amount(10, 8, 12) < slowdown_amount(11, 8, 12));
    }

    #[test]
    fn test_lone_writer_leads() {
        let wt = WriteThread::new();
        let w = wt.new_writer(Some(batch(10)), false, false, None);
        assert!(matches!(wt.join(&w), Joined::Leader));
        let group = wt.build_group(&w);
        assert_eq!(group.len(), 1);
        assert!(wt.exit(&group, Ok(())).is_ok());
        assert_eq!(wt.queue_len(), 0);
    }

    #[test]
    fn test_group_rules() {
        let wt = Arc::new(WriteThread::new());
        let leader = wt.new_writer(Some(batch(10)), false, false, None);
        assert!(matches!(wt.join(&leader), Joined::Leader));

        // queue followers from other threads while the leader holds the head
        let plain = wt.new_writer(Some(batch(10)), false, false, None);
        let sync = wt.new_writer(Some(batch(10)), true, false, None);
        let mut handles = Vec::new();
        for w in [Arc::clone(&plain), Arc::clone(&sync)] {
            let wt2 = Arc::clone(&wt);
            handles.push(thread::spawn(move || match wt2.join(&w) {
                Joined::Done(r) => r.map(|_| false),
                Joined::Leader => {
                    let group = wt2.build_group(&w);
                    wt2.exit(&group, Ok(())).map(|_| true)
                }
            }));
            while wt.queue_len() < handles.len() + 1 {
                thread::yield_now();
            }
        }

        // the sync writer may not join a non-sync leader
        let group = wt.build_group(&leader);
        assert_eq!(group.len(), 2);
        assert_eq!(group[1].id, plain.id);
        wt.exit(&group, Ok(())).unwrap();

        let led: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
        assert_eq!(led, vec![false, true]);
    }

    #[test]
    fn test_group_size_limit() {
        let wt = Arc::new(WriteThread::new());
        let leader = wt.new_writer(Some(batch(100)), false, false, None);
        assert!(matches!(wt.join(&leader), Joined::Leader));

        let big = wt.new_writer(Some(batch(SMALL_WRITE_GROUP_SLACK + 1)), false, false, None);
        let handle = {
            let wt = Arc::clone(&wt);
            let big = Arc::clone(&big);
            thread::spawn(move || match wt.join(&big) {
                Joined::Leader => {
                    let group = wt.build_group(&big);
                    wt.exit(&group, Ok(()))
                }
                Joined::Done(r) => r,
            })
        };
        while wt.queue_len() < 2 {
            thread::yield_now();
        }
        assert_eq!(wt.build_group(&leader).len(), 1);
        wt.exit(&[leader], Ok(())).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_queued_writer_times_out() {
        let wt = Arc::new(WriteThread::new());
        let leader = wt.new_writer(Some(batch(10)), false, false, None);
        assert!(matches!(wt.join(&leader), Joined::Leader));

        let waiter = wt.new_writer(
            Some(batch(10)),
            false,
            false,
            Some(Duration::from_millis(20)),
        );
        let result = match wt.join(&waiter) {
            Joined::Done(r) => r,
            Joined::Leader => panic!("writer behind a leader cannot lead"),
        };
        assert!(result.unwrap_err().is_timeout());
        // the leader is undisturbed
        assert_eq!(wt.queue_len(), 1);
        wt.exit(&[leader], Ok(())).unwrap();
    }

    #[test]
    fn test_group_failure_reaches_followers() {
        let wt = Arc::new(WriteThread::new());
        let leader = wt.new_writer(Some(batch(10)), false, false, None);
        assert!(matches!(wt.join(&leader), Joined::Leader));

        let follower = wt.new_writer(Some(batch(10)), false, false, None);
        let handle = {
            let wt = Arc::clone(&wt);
            let follower = Arc::clone(&follower);
            thread::spawn(move || match wt.join(&follower) {
                Joined::Done(r) => r,
                Joined::Leader => Ok(()),
            })
        };
        while wt.queue_len() < 2 {
            thread::yield_now();
        }
        let group = wt.build_group(&leader);
        assert_eq!(group.len(), 2);
        let err = wt
            .exit(&group, Err(TierError::Corruption("wal".into())))
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(handle.join().unwrap().unwrap_err().is_corruption());
    }
}
