use crate::channel::ModuleReadout;
use crate::config::{Conf, ConfigStore, PerModuleSettings};
use crate::dig2::Digitizer;
use crate::fanout::{FanoutReadout, MoreData};
use crate::segment::{EventSegment, ModuleIdentity};
use crate::stats::Counter;
use crate::trigger::{DataReadyPredicate, TriggerAggregator};
use crate::trigger_set::{SharedAggregator, Trigger, TriggerId, TriggerSet};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Host side of the readout: owns the trigger, the coordinator and the
/// output buffer, and drives poll/drain cycles.
pub struct RunControl {
    trigger: TriggerSet,
    bound: Option<TriggerId>,
    readout: FanoutReadout,
    more: MoreData,
    buffer: Vec<u8>,
    pub counter: Counter,
    pub run_num: usize,
    running: bool,
    paused: bool,
}

impl RunControl {
    pub fn new() -> Self {
        let more = MoreData::new();
        let readout = FanoutReadout::new(SharedAggregator::default(), more.clone());
        Self {
            trigger: TriggerSet::new(),
            bound: None,
            readout,
            more,
            buffer: Vec::new(),
            counter: Counter::new(),
            run_num: 0,
            running: false,
            paused: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn num_modules(&self) -> usize {
        self.readout.aggregator().borrow().len()
    }

    /// Build one channel per configured module and bind them as the active trigger.
    ///
    /// `factory` supplies the device for each module.
    pub fn load<D, F>(&mut self, conf: Conf, mut factory: F) -> Result<()>
    where
        D: Digitizer + 'static,
        F: FnMut(&PerModuleSettings) -> D,
    {
        if self.running {
            bail!("cannot load a configuration while run {} is active", self.run_num);
        }
        let read_timeout = Duration::from_millis(conf.run_settings.read_timeout_ms);
        self.buffer.resize(conf.run_settings.buffer_size, 0);

        let modules = conf.module_settings.modules.clone();
        let store: Rc<dyn ConfigStore> = Rc::new(conf);
        let mut aggregator = TriggerAggregator::new();
        for m in &modules {
            let identity = ModuleIdentity::new(m.name.as_str(), m.source_id, m.url.as_str());
            let channel = ModuleReadout::new(identity, factory(m), Rc::clone(&store))
                .with_read_timeout(read_timeout);
            if !aggregator.add(Box::new(DataReadyPredicate), Box::new(channel)) {
                warn!("Module {} is configured more than once, ignoring duplicate", m.name);
            }
        }

        let shared = Rc::new(RefCell::new(aggregator));
        if let Some(id) = self.bound.take() {
            self.trigger.remove(id);
        }
        self.bound = Some(self.trigger.add(Box::new(Rc::clone(&shared))));
        self.readout.rebind(shared);
        info!("Loaded configuration for {} modules", self.num_modules());
        Ok(())
    }

    pub fn begin_run(&mut self) -> Result<()> {
        if self.running {
            bail!("run {} is already active", self.run_num);
        }
        self.run_num += 1;
        self.counter.reset();
        self.readout
            .initialize()
            .with_context(|| format!("failed to start run {}", self.run_num))?;
        self.running = true;
        self.paused = false;
        info!("Run {} started", self.run_num);
        Ok(())
    }

    pub fn end_run(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.paused = false;
        self.readout
            .disable()
            .with_context(|| format!("failed to stop run {}", self.run_num))?;
        info!("Run {} stopped: {}", self.run_num, self.counter);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.running || self.paused {
            return Ok(());
        }
        self.paused = true;
        self.readout.on_pause().context("failed to pause")?;
        info!("Run {} paused", self.run_num);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.running || !self.paused {
            return Ok(());
        }
        if let Err(e) = self.readout.on_resume() {
            self.running = false;
            self.paused = false;
            return Err(e).context("failed to resume");
        }
        self.paused = false;
        info!("Run {} resumed", self.run_num);
        Ok(())
    }

    /// One trigger poll followed by a full drain.
    ///
    /// Every fragment is handed to `sink` with the source id of its module.
    /// Returns the number of fragments read.
    pub fn cycle<S>(&mut self, mut sink: S) -> Result<usize>
    where
        S: FnMut(u32, &[u8]) -> Result<()>,
    {
        if !self.running || self.paused {
            return Ok(0);
        }
        if !self.trigger.poll().context("trigger poll failed")? {
            return Ok(0);
        }
        let mut fragments = 0;
        loop {
            let n = self
                .readout
                .read(&mut self.buffer)
                .context("fragment readout failed")?;
            if n > 0 {
                let source = self.readout.last_source_id().unwrap_or_default();
                sink(source, &self.buffer[..n])?;
                self.counter.increment(n);
                fragments += 1;
            }
            if !self.more.take() {
                break;
            }
        }
        self.counter.end_cycle(fragments);
        Ok(fragments)
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModuleSettings, RunSettings};
    use crate::sim::SimDigitizer;

    fn conf(names: &[&str]) -> Conf {
        let modules = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut m = PerModuleSettings::new(name, &format!("dig2://{}", name), i as u32 + 1, 32);
                m.features.energy = true;
                m
            })
            .collect();
        Conf {
            run_settings: RunSettings {
                cycles: 0,
                run_duration: 0,
                buffer_size: 4096,
                read_timeout_ms: 0,
                sim_hit_probability: 1.0,
                reload_every: 0,
            },
            module_settings: ModuleSettings { modules },
        }
    }

    fn sim(m: &PerModuleSettings) -> SimDigitizer {
        SimDigitizer::new(4, m.source_id as u64).with_hit_probability(1.0)
    }

    #[test]
    fn cycle_drains_every_fired_module() {
        let mut run = RunControl::new();
        run.load(conf(&["a", "b", "c"]), sim).unwrap();
        assert_eq!(run.cycle(|_, _| Ok(())).unwrap(), 0);

        run.begin_run().unwrap();
        let mut sources = Vec::new();
        let n = run
            .cycle(|source, bytes| {
                assert!(!bytes.is_empty());
                sources.push(source);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(sources, vec![3, 2, 1]);
        assert_eq!(run.counter.n_fragments, 3);
        assert_eq!(run.counter.max_per_cycle, 3);
        run.end_run().unwrap();
    }

    #[test]
    fn load_is_refused_during_a_run() {
        let mut run = RunControl::new();
        run.load(conf(&["a"]), sim).unwrap();
        run.begin_run().unwrap();
        assert!(run.load(conf(&["a", "b"]), sim).is_err());
        assert!(run.begin_run().is_err());

        run.end_run().unwrap();
        run.load(conf(&["a", "b"]), sim).unwrap();
        assert_eq!(run.num_modules(), 2);
        run.begin_run().unwrap();
        assert_eq!(run.run_num, 2);
        run.end_run().unwrap();
    }

    #[test]
    fn paused_run_does_not_poll() {
        let mut run = RunControl::new();
        run.load(conf(&["a"]), sim).unwrap();
        run.begin_run().unwrap();
        run.pause().unwrap();
        assert!(run.is_running() && run.is_paused());
        assert_eq!(run.cycle(|_, _| Ok(())).unwrap(), 0);
        run.resume().unwrap();
        assert!(!run.is_paused());
        assert_eq!(run.cycle(|_, _| Ok(())).unwrap(), 1);
        run.end_run().unwrap();
        assert!(!run.is_running());
    }

    #[test]
    fn dropping_an_active_run_releases_every_device() {
        let mut handles = Vec::new();
        let mut run = RunControl::new();
        run.load(conf(&["a", "b"]), |m: &PerModuleSettings| {
            let device = sim(m);
            handles.push(device.handle());
            device
        })
        .unwrap();
        run.begin_run().unwrap();
        drop(run);

        for h in &handles {
            assert_eq!(h.count("open"), 2);
            assert_eq!(h.count("close"), 2);
            assert_eq!(h.count("cmd /cmd/disarmacquisition"), 1);
        }
    }

    #[test]
    fn sink_errors_abort_the_cycle() {
        let mut run = RunControl::new();
        run.load(conf(&["a"]), sim).unwrap();
        run.begin_run().unwrap();
        assert!(run.cycle(|_, _| bail!("disk full")).is_err());
        run.end_run().unwrap();
    }
}
