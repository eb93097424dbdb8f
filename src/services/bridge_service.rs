use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{BridgeEvent, EventBus, Topic};
use crate::config::Config;
use crate::devices::{
    DeviceReader, ProbePlan, StorageController, UnitRole, UnitSnapshots,
};
use crate::modbus::ModbusTcpClient;
use crate::output::discovery;
use crate::output::mqtt::{spawn_event_loop, MqttPublisher, MqttSender};
use crate::powerflow::{cumulate, Powerflow, PowerflowEngine};
use crate::registers::codec::DecodedBlock;
use crate::utils::error::BridgeError;

#[cfg(feature = "sqlite")]
use super::database_service::DatabaseService;
use super::scheduler::Scheduler;

struct Unit {
    key: String,
    is_leader: bool,
    client: Arc<ModbusTcpClient>,
    reader: Arc<Mutex<DeviceReader>>,
    engine: Arc<Mutex<PowerflowEngine>>,
}

/// Wires the readers, the powerflow engines, the bus and the outputs, and
/// drives them through independently ticked poll loops.
pub struct BridgeService {
    config: Config,
    scheduler: Scheduler,
    bus: Arc<EventBus>,
    units: Vec<Unit>,
    mqtt: Option<Arc<MqttPublisher>>,
    mqtt_shutdown: watch::Sender<bool>,
    mqtt_task: Option<JoinHandle<()>>,
    #[cfg(feature = "sqlite")]
    database: Option<Arc<DatabaseService>>,
    latest_flows: Arc<Mutex<HashMap<String, Powerflow>>>,
    latest_snapshots: Arc<Mutex<HashMap<String, Arc<UnitSnapshots>>>>,
    ev_load: Arc<Mutex<f64>>,
}

impl BridgeService {
    pub async fn new(config: Config) -> Result<Self, BridgeError> {
        config.validate()?;

        info!("🚀 Initializing bridge '{}' [{}]", config.bridge_name, config.bridge_uuid);
        info!("📦 Version: {}", config.bridge_version);
        info!("📡 Units: {} configured", config.units.len());

        let scheduler = Scheduler::new();
        let mut bus = EventBus::new();
        let (mqtt_shutdown, mqtt_shutdown_rx) = watch::channel(false);

        let (mqtt, mqtt_task) = if config.mqtt_enabled() {
            let mqtt_config = config.output.mqtt.as_ref().unwrap();
            let (publisher, eventloop) = MqttPublisher::connect(mqtt_config);
            let publisher = Arc::new(publisher);
            let task = spawn_event_loop(eventloop, mqtt_shutdown_rx);

            let sender = Arc::new(MqttSender::new(publisher.clone()));
            bus.subscribe(Topic::UnitSnapshots, sender.clone());
            bus.subscribe(Topic::UnitPowerflow, sender.clone());
            bus.subscribe(Topic::CumulatedPowerflow, sender.clone());
            bus.subscribe(Topic::StorageControl, sender);

            (Some(publisher), Some(task))
        } else {
            info!("📻 MQTT output disabled in configuration");
            (None, None)
        };

        #[cfg(feature = "sqlite")]
        let database = if config.database_enabled() {
            let database_config = config.output.database.as_ref().unwrap();
            match DatabaseService::new(database_config).await {
                Ok(service) => {
                    let service = Arc::new(service);
                    bus.subscribe(Topic::UnitSnapshots, service.clone());
                    bus.subscribe(Topic::UnitPowerflow, service.clone());
                    bus.subscribe(Topic::CumulatedPowerflow, service.clone());
                    bus.subscribe(Topic::StorageControl, service.clone());
                    Some(service)
                }
                Err(e) => {
                    // Configuration fault: the persistence subsystem stays
                    // down, the rest of the bridge keeps running
                    warn!("⚠️  Database service disabled: {}", e);
                    None
                }
            }
        } else {
            info!("💾 Database output disabled in configuration");
            None
        };

        let mut units = Vec::with_capacity(config.units.len());
        for (index, unit_config) in config.units.iter().enumerate() {
            let client = Arc::new(ModbusTcpClient::new(
                &unit_config.host,
                unit_config.port,
                unit_config.unit_id,
                unit_config.timeout_ms,
            ));

            let reader = DeviceReader::new(
                unit_config.identity(index),
                client.clone(),
                unit_config.meters.clone(),
                unit_config.batteries.clone(),
            );

            info!(
                "📋 Registered unit '{}' ({}) at {}:{} unit id {}",
                unit_config.key,
                unit_config.role,
                unit_config.host,
                unit_config.port,
                unit_config.unit_id
            );

            units.push(Unit {
                key: unit_config.key.clone(),
                is_leader: unit_config.role == UnitRole::Leader,
                client,
                reader: Arc::new(Mutex::new(reader)),
                engine: Arc::new(Mutex::new(PowerflowEngine::new(
                    unit_config.external_production,
                ))),
            });
        }

        Ok(Self {
            config,
            scheduler,
            bus: Arc::new(bus),
            units,
            mqtt,
            mqtt_shutdown,
            mqtt_task,
            #[cfg(feature = "sqlite")]
            database,
            latest_flows: Arc::new(Mutex::new(HashMap::new())),
            latest_snapshots: Arc::new(Mutex::new(HashMap::new())),
            ev_load: Arc::new(Mutex::new(0.0)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Externally metered EV charger load, fed into the leader's powerflow.
    pub async fn set_ev_load(&self, watts: f64) {
        *self.ev_load.lock().await = watts.max(0.0);
    }

    /// Storage control write access through the leader's connection.
    pub fn storage_controller(&self) -> StorageController {
        let leader = self
            .units
            .iter()
            .find(|u| u.is_leader)
            .expect("validated config has a leader");
        StorageController::new(leader.client.clone())
    }

    /// Spawn all poll loops and announce the bridge online.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if let Some(mqtt) = &self.mqtt {
            if let Err(e) = mqtt.announce_online().await {
                warn!("⚠️  Could not announce online state yet: {}", e);
            }
        }

        let polling = self.config.polling.clone();
        let total_units = self.units.len();

        for unit in &self.units {
            let reader = unit.reader.clone();
            let engine = unit.engine.clone();
            let bus = self.bus.clone();
            let flows = self.latest_flows.clone();
            let snapshots_cache = self.latest_snapshots.clone();
            let ev_load = self.ev_load.clone();
            let key = unit.key.clone();
            let is_leader = unit.is_leader;

            self.scheduler.spawn_loop(
                format!("unit-{}", unit.key),
                Duration::from_secs(polling.base_interval_seconds),
                move || {
                    let reader = reader.clone();
                    let engine = engine.clone();
                    let bus = bus.clone();
                    let flows = flows.clone();
                    let snapshots_cache = snapshots_cache.clone();
                    let ev_load = ev_load.clone();
                    let key = key.clone();

                    async move {
                        let snapshots = Arc::new(reader.lock().await.read_cycle().await?);
                        snapshots_cache.lock().await.insert(key.clone(), snapshots.clone());
                        bus.publish_detached(
                            Topic::UnitSnapshots,
                            BridgeEvent::UnitSnapshots(snapshots.clone()),
                        )
                        .await;

                        // The EV charger hangs off the leader's grid meter
                        let ev = if is_leader { *ev_load.lock().await } else { 0.0 };
                        let flow = engine.lock().await.from_devices(&snapshots, ev)?;
                        bus.publish_sync(
                            Topic::UnitPowerflow,
                            BridgeEvent::UnitPowerflow(Arc::new(flow.clone())),
                        )
                        .await;

                        let cumulated = {
                            let mut flows = flows.lock().await;
                            flows.insert(key.clone(), flow);
                            (is_leader && flows.len() == total_units)
                                .then(|| cumulate(flows.values()))
                        };

                        if let Some(cumulated) = cumulated {
                            bus.publish_sync(
                                Topic::CumulatedPowerflow,
                                BridgeEvent::CumulatedPowerflow(Arc::new(cumulated)),
                            )
                            .await;
                        }

                        Ok(())
                    }
                },
            );
        }

        let leader = self
            .units
            .iter()
            .find(|u| u.is_leader)
            .expect("validated config has a leader");
        {
            let reader = leader.reader.clone();
            let bus = self.bus.clone();
            self.scheduler.spawn_loop(
                "storage-control",
                Duration::from_secs(polling.storage_interval_seconds),
                move || {
                    let reader = reader.clone();
                    let bus = bus.clone();
                    async move {
                        let control = reader.lock().await.read_storage_control().await?;
                        bus.publish_detached(
                            Topic::StorageControl,
                            BridgeEvent::StorageControl(Arc::new(control)),
                        )
                        .await;
                        Ok(())
                    }
                },
            );
        }

        {
            let flows = self.latest_flows.clone();
            self.scheduler.spawn_loop(
                "summary",
                Duration::from_secs(polling.summary_interval_seconds),
                move || {
                    let flows = flows.clone();
                    async move {
                        let flows = flows.lock().await;
                        if flows.is_empty() {
                            return Ok(());
                        }
                        let total = cumulate(flows.values());
                        info!(
                            "☀️  PV {} W | 🔋 battery {} W | ⚡ grid {} W | 🏠 house {} W",
                            total.inverter.pv_production,
                            total.battery.power,
                            total.grid.power,
                            total.consumer.house
                        );
                        Ok(())
                    }
                },
            );
        }

        if let Some(mqtt) = &self.mqtt {
            let publisher = mqtt.clone();
            let snapshots_cache = self.latest_snapshots.clone();
            let prefix = publisher.topic_prefix().to_string();

            self.scheduler.spawn_loop(
                "discovery",
                Duration::from_secs(polling.discovery_interval_seconds),
                move || {
                    let publisher = publisher.clone();
                    let snapshots_cache = snapshots_cache.clone();
                    let prefix = prefix.clone();

                    async move {
                        publisher.announce_online().await?;

                        let payloads = {
                            let cache = snapshots_cache.lock().await;
                            let mut payloads = discovery::powerflow_sensors(&prefix);
                            for (key, snapshots) in cache.iter() {
                                payloads.extend(discovery::inverter_sensors(
                                    &prefix,
                                    key,
                                    &snapshots.inverter.identity,
                                ));
                                for (slot, battery) in &snapshots.batteries {
                                    payloads.extend(discovery::battery_sensors(
                                        &prefix,
                                        key,
                                        *slot,
                                        &battery.identity,
                                    ));
                                }
                            }
                            payloads
                        };

                        discovery::register_sensors(&publisher, &payloads).await?;
                        info!("🏠 Announced {} discovery sensor(s)", payloads.len());
                        Ok(())
                    }
                },
            );
        }

        #[cfg(feature = "sqlite")]
        if let Some(database) = &self.database {
            let database = database.clone();
            self.scheduler.spawn_loop(
                "db-maintenance",
                Duration::from_secs(polling.maintenance_interval_seconds),
                move || {
                    let database = database.clone();
                    async move {
                        database.maintenance().await?;
                        Ok(())
                    }
                },
            );
        }

        info!("✅ Bridge started");
        Ok(())
    }

    /// Stop the loops, drain detached deliveries, say goodbye to the broker.
    pub async fn shutdown(&mut self) {
        self.scheduler.shutdown().await;
        self.bus.shutdown().await;

        if let Some(mqtt) = &self.mqtt {
            if let Err(e) = mqtt.announce_offline().await {
                warn!("⚠️  Could not announce offline state: {}", e);
            }
            mqtt.disconnect().await;
        }

        let _ = self.mqtt_shutdown.send(true);
        if let Some(task) = self.mqtt_task.take() {
            let _ = task.await;
        }

        info!("👋 Bridge stopped");
    }

    // One-shot operations for the CLI

    pub async fn read_once(&self) -> Result<Vec<UnitSnapshots>, BridgeError> {
        let mut all = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            all.push(unit.reader.lock().await.read_cycle().await?);
        }
        Ok(all)
    }

    pub async fn powerflow_once(&self) -> Result<Powerflow, BridgeError> {
        let mut flows = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let snapshots = unit.reader.lock().await.read_cycle().await?;
            flows.push(unit.engine.lock().await.from_devices(&snapshots, 0.0)?);
        }
        Ok(cumulate(flows.iter()))
    }

    pub async fn probe_report(&self) -> Result<Vec<(String, ProbePlan)>, BridgeError> {
        let mut report = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let plan = unit.reader.lock().await.read_probe_plan().await?;
            report.push((unit.key.clone(), plan));
        }
        Ok(report)
    }

    pub async fn registers_dump(&self) -> Result<Vec<(String, DecodedBlock)>, BridgeError> {
        let mut dump = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let block = unit.reader.lock().await.read_inverter_block().await?;
            dump.push((unit.key.clone(), block));
        }
        Ok(dump)
    }
}
