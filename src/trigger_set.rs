use crate::trigger::TriggerAggregator;
use crate::Result;
use std::cell::RefCell;
use std::rc::Rc;

/// Anything the host can poll once per cycle.
pub trait Trigger {
    /// True if anything fired.
    fn poll(&mut self) -> Result<bool>;
}

impl Trigger for TriggerAggregator {
    fn poll(&mut self) -> Result<bool> {
        TriggerAggregator::poll(self)
    }
}

impl<T: Trigger + ?Sized> Trigger for Rc<RefCell<T>> {
    fn poll(&mut self) -> Result<bool> {
        self.borrow_mut().poll()
    }
}

pub type SharedAggregator = Rc<RefCell<TriggerAggregator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerId(u64);

/// A rebindable collection of triggers that fires when any member fires.
#[derive(Default)]
pub struct TriggerSet {
    members: Vec<(TriggerId, Box<dyn Trigger>)>,
    next_id: u64,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, trigger: Box<dyn Trigger>) -> TriggerId {
        let id = TriggerId(self.next_id);
        self.next_id += 1;
        self.members.push((id, trigger));
        id
    }

    pub fn remove(&mut self, id: TriggerId) -> Option<Box<dyn Trigger>> {
        let pos = self.members.iter().position(|(m, _)| *m == id)?;
        Some(self.members.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Trigger for TriggerSet {
    /// Poll every member; the first failure is reported after all were polled.
    fn poll(&mut self) -> Result<bool> {
        let mut fired = false;
        let mut first_err = None;
        for (_, member) in self.members.iter_mut() {
            match member.poll() {
                Ok(f) => fired |= f,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }
}
