use clap::{App, Arg};
use colored::*;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::{error, info, warn};
use vanet::claims::ConsumerKey;
use vanet::reconcile::{self, ReconciliationLoop};
use vanet::simulation::{SimulatedFleet, SimulatedTransport, SimulationConfig};
use vanet::vehicle::Vehicle;
use vanet::VanetConfig;

const DEFAULT_DEVICES: &str = "3";
const DEFAULT_CONSUMERS: &str = "2";
const DEFAULT_TICK_MS: &str = "500";

type Reconciler = ReconciliationLoop<SimulatedTransport>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("vanet")
        .version("0.1.0")
        .author("VANET Engineering Team")
        .about("🚗 Live vehicle model over a simulated fleet of telemetry devices")
        .arg(
            Arg::with_name("devices")
                .short("d")
                .long("devices")
                .value_name("COUNT")
                .help("Number of simulated devices")
                .takes_value(true)
                .default_value(DEFAULT_DEVICES)
                .validator(|v| match v.parse::<usize>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Device count must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("consumers")
                .short("c")
                .long("consumers")
                .value_name("COUNT")
                .help("Number of display consumers claiming vehicles")
                .takes_value(true)
                .default_value(DEFAULT_CONSUMERS)
                .validator(|v| match v.parse::<usize>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Consumer count must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("tick-ms")
                .short("t")
                .long("tick-ms")
                .value_name("MILLIS")
                .help("Simulation and display period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Tick period must be a positive number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("ticks")
                .short("n")
                .long("ticks")
                .value_name("COUNT")
                .help("Stop after this many ticks (runs until Ctrl+C if omitted)")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Tick count must be a number".into()),
                }),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => VanetConfig::load(path)?,
        None => VanetConfig::default(),
    };
    let device_count: usize = matches.value_of("devices").unwrap_or(DEFAULT_DEVICES).parse()?;
    let consumer_count: usize = matches.value_of("consumers").unwrap_or(DEFAULT_CONSUMERS).parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;
    let max_ticks: Option<u64> = matches.value_of("ticks").map(str::parse::<u64>).transpose()?;
    let json_output = matches.value_of("format") == Some("json");

    println!("{}", "🚗 VANET vehicle monitor".bright_blue().bold());
    println!("   devices: {}  consumers: {}  tick: {}ms", device_count, consumer_count, tick_ms);

    let simulation = SimulationConfig {
        device_count,
        name_prefix: config.device_name_prefix.clone(),
        service_id: config.service_id.clone(),
        ..SimulationConfig::default()
    };
    let fleet = Arc::new(StdMutex::new(SimulatedFleet::new(simulation)));
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let transport = SimulatedTransport::new(Arc::clone(&fleet), event_tx.clone());
    let reconciler: Arc<Mutex<Reconciler>> =
        Arc::new(Mutex::new(ReconciliationLoop::new(config, transport)));
    reconciler.lock().await.start()?;

    let pump = tokio::spawn(reconcile::drive(Arc::clone(&reconciler), event_rx));

    let consumers: Vec<ConsumerKey> = (1..=consumer_count)
        .map(|i| ConsumerKey::new(format!("node-{}", i)))
        .collect();

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }

        let produced = match fleet.lock() {
            Ok(mut fleet) => fleet.tick(),
            Err(e) => {
                error!("simulated fleet unavailable: {}", e);
                break;
            }
        };
        for event in produced {
            if event_tx.send(event).is_err() {
                warn!("event pump stopped");
                break;
            }
        }

        let claimed = {
            let mut reconciler = reconciler.lock().await;
            for key in &consumers {
                if reconciler.claims().claim_for(key).is_none() {
                    let _ = reconciler.allocate(key);
                }
            }
            reconciler.claimed()
        };

        tick += 1;
        if json_output {
            print_json(tick, &claimed)?;
        } else {
            print_table(tick, &claimed);
        }

        if max_ticks.map_or(false, |max| tick >= max) {
            break;
        }
    }

    let stats = {
        let mut reconciler = reconciler.lock().await;
        reconciler.stop();
        reconciler.get_stats().clone()
    };
    drop(event_tx);
    pump.abort();

    println!("{}", "🛑 Monitor stopped".bright_yellow());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_table(tick: u64, claimed: &[(ConsumerKey, Vehicle)]) {
    println!("{} {}", "⏱".bright_blue(), format!("tick {}", tick).bright_white().bold());
    if claimed.is_empty() {
        println!("   {}", "no vehicles claimed yet".yellow());
        return;
    }
    for (key, vehicle) in claimed {
        let reading = vehicle.reading();
        let id = if reading.id < 0 {
            "?".to_string()
        } else {
            reading.id.to_string()
        };
        let speed = format!("{:+.2}", reading.speed);
        let speed = if reading.speed < 0.0 { speed.bright_red() } else { speed.bright_green() };
        let distance = if vehicle.has_front_reading() {
            reading.front_sensor_value.to_string().bright_cyan()
        } else {
            "-".dimmed()
        };
        println!(
            "   {:<8} {:<10} id={:<3} v={} h={:+.2} d={}",
            key.as_str().bright_white(),
            vehicle.handle().as_str(),
            id,
            speed,
            reading.heading,
            distance
        );
    }
}

fn print_json(tick: u64, claimed: &[(ConsumerKey, Vehicle)]) -> Result<(), serde_json::Error> {
    let entries: Vec<serde_json::Value> = claimed
        .iter()
        .map(|(key, vehicle)| {
            serde_json::json!({
                "consumer": key,
                "handle": vehicle.handle(),
                "reading": vehicle.reading(),
            })
        })
        .collect();
    let line = serde_json::json!({ "tick": tick, "claimed": entries });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}
