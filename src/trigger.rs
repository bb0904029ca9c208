use crate::segment::ReadoutChannel;
use crate::Result;
use log::debug;
use std::time::Duration;

/// Decides whether a channel has something to read this cycle.
pub trait TriggerPredicate {
    fn fired(&mut self, channel: &mut dyn ReadoutChannel) -> Result<bool>;
}

/// Fires when the module reports a hit waiting. Never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataReadyPredicate;

impl TriggerPredicate for DataReadyPredicate {
    fn fired(&mut self, channel: &mut dyn ReadoutChannel) -> Result<bool> {
        channel.data_ready(Duration::ZERO)
    }
}

/// Index of a registered channel, valid until the next `poll` or `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle(usize);

struct Registration {
    predicate: Box<dyn TriggerPredicate>,
    channel: Box<dyn ReadoutChannel>,
}

/// Ordered (predicate, channel) pairs polled together once per cycle.
#[derive(Default)]
pub struct TriggerAggregator {
    slots: Vec<Registration>,
    worklist: Vec<ChannelHandle>,
}

impl TriggerAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Returns false if one with the same name is already present.
    pub fn add(
        &mut self,
        predicate: Box<dyn TriggerPredicate>,
        channel: Box<dyn ReadoutChannel>,
    ) -> bool {
        let name = &channel.identity().name;
        if self.slots.iter().any(|r| &r.channel.identity().name == name) {
            return false;
        }
        self.slots.push(Registration { predicate, channel });
        true
    }

    /// Unregister by module name, handing the channel back.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn ReadoutChannel>> {
        let pos = self
            .slots
            .iter()
            .position(|r| r.channel.identity().name == name)?;
        self.worklist.clear();
        Some(self.slots.remove(pos).channel)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Evaluate every predicate and rebuild the worklist from those that fired.
    ///
    /// Evaluation never stops early. On failure the worklist is left empty and
    /// the first error is returned.
    pub fn poll(&mut self) -> Result<bool> {
        self.worklist.clear();
        let mut first_err = None;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot.predicate.fired(slot.channel.as_mut()) {
                Ok(true) => self.worklist.push(ChannelHandle(i)),
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            self.worklist.clear();
            return Err(e);
        }
        debug!(
            "Trigger poll: {} of {} modules ready",
            self.worklist.len(),
            self.slots.len()
        );
        Ok(!self.worklist.is_empty())
    }

    pub fn worklist(&self) -> &[ChannelHandle] {
        &self.worklist
    }

    pub fn worklist_mut(&mut self) -> &mut Vec<ChannelHandle> {
        &mut self.worklist
    }

    pub fn channel_mut(&mut self, handle: ChannelHandle) -> Option<&mut dyn ReadoutChannel> {
        let slot = self.slots.get_mut(handle.0)?;
        Some(slot.channel.as_mut())
    }

    /// Take the most recently fired channel off the worklist.
    pub fn pop_triggered(&mut self) -> Option<&mut dyn ReadoutChannel> {
        let handle = self.worklist.pop()?;
        self.channel_mut(handle)
    }

    /// Every registered channel in registration order.
    pub fn channels(&self) -> impl Iterator<Item = &dyn ReadoutChannel> + '_ {
        self.slots.iter().map(|r| r.channel.as_ref())
    }

    pub fn channels_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut (dyn ReadoutChannel + 'static)> + '_ {
        self.slots.iter_mut().map(|r| r.channel.as_mut())
    }
}
