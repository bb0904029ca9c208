use dig2_readout::*;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

const CONFIG: &str = r#"
[run_settings]
buffer_size = 65536
read_timeout_ms = 0
sim_hit_probability = 0.5

[module_settings]
modules = [
    { name = "adc1", url = "dig2://caendgtz-usb-1", source_id = 11, record_len = 48, pre_trig_len = 8, analog_probes = ["ADCInput"], digital_probes = ["Trigger"], features = { timestamp = true, energy = true, analog_probes = [true, false], digital_probes = [true, false, false, false] } },
    { name = "adc2", url = "dig2://caendgtz-usb-2", source_id = 12, record_len = 16, features = { timestamp = true, fine_timestamp = true } },
    { name = "adc3", url = "dig2://caendgtz-usb-3", source_id = 13, record_len = 32, start_source = "SINlevel", en_chans = [1, 2] },
]
"#;

fn load_conf() -> Conf {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    Conf::from_file(file.path()).unwrap()
}

struct Rig {
    coordinator: FanoutReadout,
    trigger: TriggerSet,
    more: MoreData,
    handles: Vec<SimHandle>,
}

fn rig(conf: Conf) -> Rig {
    let store: Rc<dyn ConfigStore> = Rc::new(conf.clone());
    let aggregator: SharedAggregator = Rc::new(RefCell::new(TriggerAggregator::new()));
    let mut handles = Vec::new();
    for m in &conf.module_settings.modules {
        let sim = SimDigitizer::new(4, u64::from(m.source_id));
        handles.push(sim.handle());
        let identity = ModuleIdentity::new(m.name.as_str(), m.source_id, m.url.as_str());
        let channel = ModuleReadout::new(identity, sim, Rc::clone(&store));
        assert!(aggregator
            .borrow_mut()
            .add(Box::new(DataReadyPredicate), Box::new(channel)));
    }
    let more = MoreData::new();
    let coordinator = FanoutReadout::new(Rc::clone(&aggregator), more.clone());
    let mut trigger = TriggerSet::new();
    trigger.add(Box::new(aggregator));
    Rig {
        coordinator,
        trigger,
        more,
        handles,
    }
}

fn hit(channel: u8, ts: u64, len: usize) -> DecodedHit {
    let mut hit = DecodedHit {
        channel,
        timestamp_ns: ts,
        fine_timestamp: 3,
        energy: 1000 + channel as u16,
        ..Default::default()
    };
    hit.analog_probes[0] = Some(AnalogProbe {
        kind: 0,
        samples: vec![2048; len],
    });
    hit.digital_probes[0] = Some(DigitalProbe {
        kind: 0,
        samples: vec![0; len],
    });
    hit
}

/// One poll followed by a drain, as the host scheduler does it.
fn cycle(rig: &mut Rig, buf: &mut [u8]) -> Vec<(u32, Fragment)> {
    let mut out = Vec::new();
    if !rig.trigger.poll().unwrap() {
        return out;
    }
    loop {
        let n = rig.coordinator.read(buf).unwrap();
        if n > 0 {
            let source = rig.coordinator.last_source_id().unwrap();
            out.push((source, decode(&buf[..n]).unwrap()));
        }
        if !rig.more.take() {
            break;
        }
    }
    out
}

#[test]
fn scripted_hits_drain_in_reverse_registration_order() {
    let mut rig = rig(load_conf());
    rig.coordinator.initialize().unwrap();
    rig.handles[0].queue_hit(hit(0, 100, 48));
    rig.handles[1].queue_hit(hit(2, 200, 16));
    rig.handles[2].queue_hit(hit(1, 300, 32));

    let mut buf = vec![0u8; 65536];
    let fragments = cycle(&mut rig, &mut buf);
    let order: Vec<(u32, &str)> = fragments
        .iter()
        .map(|(s, f)| (*s, f.name.as_str()))
        .collect();
    assert_eq!(order, [(13, "adc3"), (12, "adc2"), (11, "adc1")]);

    let adc1 = &fragments[2].1.hit;
    assert_eq!(adc1.timestamp_ns, 100);
    assert_eq!(adc1.energy, 1000);
    assert_eq!(adc1.fine_timestamp, 0);
    assert_eq!(adc1.analog_probes[0].as_ref().unwrap().samples.len(), 48);
    assert!(adc1.analog_probes[1].is_none());
    assert_eq!(adc1.digital_probes[0].as_ref().unwrap().samples.len(), 48);

    let adc2 = &fragments[1].1.hit;
    assert_eq!(adc2.channel, 2);
    assert_eq!(adc2.fine_timestamp, 3);
    assert_eq!(adc2.energy, 0);
    assert!(adc2.analog_probes.iter().all(Option::is_none));

    let adc3 = &fragments[0].1.hit;
    assert_eq!(adc3.timestamp_ns, 0);
    assert_eq!(adc3.channel, 1);

    assert!(cycle(&mut rig, &mut buf).is_empty());
    rig.coordinator.disable().unwrap();
}

#[test]
fn only_triggered_modules_are_read() {
    let mut rig = rig(load_conf());
    rig.coordinator.initialize().unwrap();
    rig.handles[1].queue_hit(hit(0, 1, 16));
    rig.handles[1].queue_hit(hit(3, 2, 16));
    for h in &rig.handles {
        h.clear_log();
    }

    let mut buf = vec![0u8; 4096];
    let first = cycle(&mut rig, &mut buf);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].1.hit.channel, 0);
    assert_eq!(rig.handles[0].count("readdata"), 0);
    assert_eq!(rig.handles[2].count("readdata"), 0);
    for h in &rig.handles {
        assert_eq!(h.count("hasdata"), 1);
    }

    let second = cycle(&mut rig, &mut buf);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].1.hit.channel, 3);
}

#[test]
fn pause_and_resume_rearm_every_module() {
    let mut rig = rig(load_conf());
    rig.coordinator.initialize().unwrap();
    rig.handles[0].queue_hit(hit(0, 1, 48));
    rig.coordinator.on_pause().unwrap();
    for h in &rig.handles {
        assert_eq!(h.count("close"), 1);
    }

    rig.coordinator.on_resume().unwrap();
    for h in &rig.handles {
        assert_eq!(h.count("open"), 2);
        assert_eq!(h.count("cmd /cmd/armacquisition"), 2);
    }
    assert_eq!(rig.handles[2].count("cmd /cmd/swstartacquisition"), 0);
    // Arming clears data left over from before the pause.
    assert_eq!(rig.handles[0].pending(), 0);
    rig.coordinator.disable().unwrap();
}

#[test]
fn one_bad_module_disconnects_all() {
    let mut conf = load_conf();
    conf.module_settings.modules[1].trig_source = "Laser".to_string();
    let mut rig = rig(conf);

    let err = rig.coordinator.initialize().unwrap_err();
    assert!(matches!(
        err,
        ReadoutError::Validation { ref module, ref parameter, .. }
            if module == "adc2" && parameter == "trig_source"
    ));
    for h in &rig.handles {
        assert_eq!(h.count("open"), h.count("close"));
    }
    assert_eq!(rig.handles[2].count("open"), 0);
}

#[test]
fn device_fault_mid_drain_aborts_only_that_read() {
    let mut rig = rig(load_conf());
    rig.coordinator.initialize().unwrap();
    rig.handles[0].queue_hit(hit(0, 1, 48));
    rig.handles[2].queue_hit(hit(1, 2, 32));
    rig.handles[2].fail_on("readdata", FELibReturn::Comm);

    assert!(rig.trigger.poll().unwrap());
    let mut buf = vec![0u8; 4096];
    assert!(matches!(
        rig.coordinator.read(&mut buf),
        Err(ReadoutError::Device { code: FELibReturn::Comm, .. })
    ));
    assert!(rig.more.get());
    let n = rig.coordinator.read(&mut buf).unwrap();
    assert_eq!(decode(&buf[..n]).unwrap().name, "adc1");
    assert!(!rig.more.get());
}

#[test]
fn rebinding_tears_down_the_old_modules() {
    let Rig {
        mut coordinator,
        trigger,
        handles,
        ..
    } = rig(load_conf());
    coordinator.initialize().unwrap();
    handles[0].queue_hit(hit(0, 1, 48));
    drop(trigger);

    coordinator.rebind(Rc::new(RefCell::new(TriggerAggregator::new())));
    for h in &handles {
        assert_eq!(h.count("close"), 1);
        assert_eq!(h.count("cmd /cmd/disarmacquisition"), 1);
    }
    assert_eq!(coordinator.aggregator().borrow().len(), 0);
}

#[test]
fn run_control_over_random_hits() {
    let conf = load_conf();
    let mut run = RunControl::new();
    run.load(conf, |m: &PerModuleSettings| {
        SimDigitizer::new(4, u64::from(m.source_id)).with_hit_probability(0.5)
    })
    .unwrap();
    run.begin_run().unwrap();

    let mut seen = Vec::new();
    for _ in 0..200 {
        run.cycle(|source, bytes| {
            assert_eq!(bytes.len() % 2, 0);
            let fragment = decode(bytes)?;
            seen.push((source, fragment.name));
            Ok(())
        })
        .unwrap();
    }
    run.end_run().unwrap();

    for (source, name) in [(11, "adc1"), (12, "adc2"), (13, "adc3")] {
        assert!(seen.iter().any(|(s, n)| *s == source && n == name));
    }
    assert!(seen.iter().all(|(s, n)| format!("adc{}", s - 10) == *n));
    assert_eq!(run.counter.n_fragments, seen.len());
}
