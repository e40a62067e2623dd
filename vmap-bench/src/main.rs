use std::thread;
use std::time::Instant;

use log::{error, info, warn};
use structopt::StructOpt;
use virtual_map::hash::short_hex;
use virtual_map::{memory_channel, ReconnectOutcome, Role, VirtualMap};
use vmap_options::Options;

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn value(i: u64, round: u64) -> Vec<u8> {
    format!("value-{}-{}", i, round).into_bytes()
}

fn run(options: &Options) -> virtual_map::Result<()> {
    let mut teacher: VirtualMap = VirtualMap::open(options.map_config("teacher"))?;

    let start = Instant::now();
    for i in 0..options.keys {
        teacher.put(&key(i), &value(i, 0))?;
    }
    info!("Inserted {} keys in {:?}", options.keys, start.elapsed());

    let start = Instant::now();
    let root = teacher.root_hash()?;
    info!(
        "Sync hash {} in {:?} ({:?})",
        short_hex(&root),
        start.elapsed(),
        teacher.last_hash_stats()
    );

    let removal = options.removal_range();
    let start = Instant::now();
    let mut removed = 0u64;
    for i in removal.clone() {
        if teacher.remove(&key(i))?.is_some() {
            removed += 1;
        }
    }
    info!("Removed {} keys in {:?}", removed, start.elapsed());

    // 每隔一个 key 更新一次，再用线程池 hash
    let snapshot = teacher.copy()?;
    for i in (0..options.keys).step_by(2).filter(|i| !removal.contains(i)) {
        teacher.put(&key(i), &value(i, 1))?;
    }
    let start = Instant::now();
    let root = teacher.hash_async()?;
    info!(
        "Async hash {} in {:?} ({:?})",
        short_hex(&root),
        start.elapsed(),
        teacher.last_hash_stats()
    );
    drop(snapshot);

    let start = Instant::now();
    teacher.sync()?;
    info!("Synced {} leaves in {:?}", teacher.len(), start.elapsed());

    if !options.no_reconnect {
        let mut learner: VirtualMap = VirtualMap::open(options.map_config("learner"))?;
        for i in 0..options.keys / 2 {
            learner.put(&key(i), &value(i, 0))?;
        }

        let (teacher_end, learner_end, _link) = memory_channel();
        let mut serving = teacher.teacher()?;
        let start = Instant::now();
        let server = thread::spawn(move || serving.serve(teacher_end));
        let outcome = learner.start_reconnect(Role::Learner, learner_end)?;
        let served = server
            .join()
            .unwrap_or_else(|e| std::panic::resume_unwind(e))?;
        info!(
            "Reconnect finished in {:?}: learner {:?}, teacher {:?}",
            start.elapsed(),
            outcome,
            served
        );
        info!("Learner stats: {:?}", learner.last_reconnect_stats());

        match outcome {
            ReconnectOutcome::Success { root_hash } if root_hash == root => {}
            other => warn!("Learner did not converge: {:?}", other),
        }
        learner.close()?;
    }

    teacher.close()?;
    Ok(())
}

fn main() {
    env_logger::init();
    let options: Options = Options::from_args();
    info!("{:?}", options);

    if options.db_dir.exists() {
        if let Err(e) = fs_extra::dir::remove(&options.db_dir) {
            error!("Cannot clear {}: {}", options.db_dir.display(), e);
            std::process::exit(1);
        }
    }

    let result = run(&options);

    if !options.keep_data {
        let _ = fs_extra::dir::remove(&options.db_dir);
    }
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
