// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Taps the jpaxos persistent log and prints one line per proposed and
//! truncated consensus instance.
use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use getopts::Options;
use libc::pid_t;
use tokio::runtime;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use uptap::{
    ArgSource, Dispatcher, Error, EventChannel, EventSchema, FieldKind, ProbeDescriptor,
    ProbeEngine, UprobeTracer,
};

const PROPOSE_SYMBOL: &str =
    "_ZN17ConsensusInstance22updateStateFromProposeEP7JNIEnv_iiP11_jbyteArray";
const TRUNCATE_SYMBOL: &str = "Java_lsr_paxos_storage_PersistentLog_truncateBelow_1";
const DEFAULT_LIBRARY: &str = "./libjpaxos-pmem.so";
const DEFAULT_CAPACITY: usize = 512;
const POLL_WAIT: Duration = Duration::from_millis(100);

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    if unsafe { libc::geteuid() } != 0 {
        error!("uptap-loggrowth: you must be root to attach uprobes");
        process::exit(1);
    }

    let opts = match parse_opts() {
        Some(o) => o,
        None => process::exit(1),
    };

    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let code = rt.block_on(run(opts));
    process::exit(code);
}

async fn run(opts: Opts) -> i32 {
    let propose_schema = EventSchema::new(
        "propose",
        &[("id", FieldKind::I32), ("view", FieldKind::I32)],
    );
    let truncate_schema = EventSchema::new("truncate", &[("id", FieldKind::I32)]);

    // updateStateFromPropose(this, jni, view, id is the first field of
    // *this); truncateBelow_1(jni, class, id).
    let descriptors = vec![
        ProbeDescriptor::describe(
            propose_schema.clone(),
            &opts.library,
            PROPOSE_SYMBOL,
            &[ArgSource::Deref { slot: 1, offset: 0 }, ArgSource::Slot(4)],
        ),
        ProbeDescriptor::describe(
            truncate_schema.clone(),
            &opts.library,
            TRUNCATE_SYMBOL,
            &[ArgSource::Slot(3)],
        ),
    ];

    let mut channel = EventChannel::with_capacity(opts.capacity);
    let mut engine = ProbeEngine::new(UprobeTracer::new(opts.pid));
    for descriptor in descriptors {
        let descriptor = match descriptor {
            Ok(d) => d,
            Err(e) => {
                error!("invalid probe: {:?}", e);
                return 1;
            }
        };
        let name = descriptor.probe_name();
        if let Err(e) = engine.attach(descriptor, channel.submitter()) {
            error!("failed to attach {}: {:?}", name, e);
            return 1;
        }
    }
    info!(
        "tapping {} ({} probes), hit Ctrl-C to quit",
        opts.library.display(),
        engine.attached()
    );

    let mut dispatcher = Dispatcher::new();
    dispatcher.on(&propose_schema, |event| {
        let id = event
            .field("id")
            .ok_or_else(|| Error::Handler("propose event without id".to_string()))?;
        println!("Propose  I: {}", id);
        Ok(())
    });
    dispatcher.on(&truncate_schema, |event| {
        let id = event
            .field("id")
            .ok_or_else(|| Error::Handler("truncate event without id".to_string()))?;
        println!("Truncate I: {}", id);
        Ok(())
    });

    let stop = dispatcher.stop_handle();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        stop.stop();
    });

    if let Err(e) = dispatcher.run(&mut channel, POLL_WAIT).await {
        error!("dispatch failed: {:?}", e);
        return 1;
    }
    let drops = channel.pending_drops();
    if drops > 0 {
        warn!("{} events dropped", drops);
    }
    0
}

struct Opts {
    library: PathBuf,
    pid: Option<pid_t>,
    capacity: usize,
}

fn parse_opts() -> Option<Opts> {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt(
        "l",
        "library",
        &format!(
            "path or name of the library to tap (default {})",
            DEFAULT_LIBRARY
        ),
        "LIBRARY",
    );
    opts.optopt(
        "p",
        "pid",
        "tap only this process instead of the whole system",
        "PID",
    );
    opts.optopt(
        "c",
        "capacity",
        &format!(
            "queued events before new ones are dropped (default {})",
            DEFAULT_CAPACITY
        ),
        "N",
    );
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}\n", f);
            print_usage(&program, opts);
            return None;
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, opts);
        return None;
    }

    let library = PathBuf::from(
        matches
            .opt_str("l")
            .unwrap_or_else(|| DEFAULT_LIBRARY.to_string()),
    );
    let pid = match matches.opt_str("p") {
        Some(pid) => match pid.parse::<pid_t>() {
            Ok(pid) => Some(pid),
            Err(err) => {
                eprintln!("Invalid PID: {}", err);
                return None;
            }
        },
        None => None,
    };
    let capacity = match matches.opt_str("c") {
        Some(capacity) => match capacity.parse::<usize>() {
            Ok(capacity) => capacity,
            Err(err) => {
                eprintln!("Invalid capacity: {}", err);
                return None;
            }
        },
        None => DEFAULT_CAPACITY,
    };

    Some(Opts {
        library,
        pid,
        capacity,
    })
}

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}
