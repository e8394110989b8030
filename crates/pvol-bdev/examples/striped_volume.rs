//! Minimal host: two in-memory base devices pooled into one striped volume.
//!
//! Parses a config (including its `[log]` section), initializes logging,
//! brings the volume online on a two-core executor, then runs one write and
//! one read through the striping path and prints the volume dump.
//!
//! Run with `cargo run -p pvol-bdev --example striped_volume`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::bounded;

use pvol_bdev::membdev::MemBdev;
use pvol_bdev::{CoreExecutor, IoRequest, PollResult, RegistryContext, Scheduler};
use pvol_config::PvolConfig;
use pvol_logging::init_logging;

const CONFIG: &str = r#"
[log]
level = "debug"

[[volume]]
name = "pvol0"
strip_size_kb = 32
base_devices = ["mem0", "mem1"]
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = PvolConfig::from_toml_str(CONFIG)?;
    let _log_guard = init_logging(&config.log);

    let executor = Arc::new(CoreExecutor::new(2, Duration::from_millis(1)));
    let registry = RegistryContext::new(executor.clone(), true);
    registry.start();
    registry.apply_config(&config)?;

    // MemBdev defers completions until pumped; drive it from core 0.
    let mem0 = Arc::new(MemBdev::new("mem0", 512, 8192));
    let mem1 = Arc::new(MemBdev::new("mem1", 512, 8192));
    let (p0, p1) = (mem0.clone(), mem1.clone());
    executor.register_periodic(
        0,
        Box::new(move || {
            if p0.pump() + p1.pump() > 0 {
                PollResult::Busy
            } else {
                PollResult::Idle
            }
        }),
    );

    // The volume comes online once both constituents are announced.
    registry.on_device_appeared(mem0.clone())?;
    registry.on_device_appeared(mem1.clone())?;

    let volume = registry.open_volume("pvol0")?;
    let channel = volume.get_io_channel(0)?;

    // 128 blocks starting at block 32: crosses a strip boundary, so the
    // write fans out across both devices.
    let payload = Bytes::from((0..128 * 512).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let (tx, rx) = bounded(1);
    volume.submit_request(
        &channel,
        IoRequest::write(
            32,
            128,
            payload.clone(),
            Box::new(move |completion| {
                let _ = tx.send(completion.success);
            }),
        ),
    );
    assert!(rx.recv()?, "write failed");

    let (tx, rx) = bounded(1);
    volume.submit_request(
        &channel,
        IoRequest::read(
            32,
            128,
            Box::new(move |completion| {
                let success = completion.success;
                let _ = tx.send(completion.data.filter(|_| success));
            }),
        ),
    );
    let data = rx.recv()?.expect("read failed");
    assert_eq!(data, payload);
    println!("wrote and read back {} blocks", 128);

    let dump = registry.dump_volume("pvol0")?;
    println!("{}", serde_json::to_string_pretty(&dump)?);

    drop(channel);
    registry.stop();
    executor.shutdown();
    Ok(())
}
