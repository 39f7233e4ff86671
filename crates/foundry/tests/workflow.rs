//! Workflow and pipeline behavior against a scripted in-memory client.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use foundry::client::{
    BondRequest, ClientError, CommissionOpts, CreateMachineSpec, DeployOpts, LinkMode,
    MachineUpdate, ProvisionClient, ReleaseOpts,
};
use foundry::config::{Action, ActionSet, BondConfig, MachineConfig, WorkflowConfig};
use foundry::machine::{MachineRecord, MachineState};
use foundry::network::{InterfaceDescriptor, InterfaceKind, SubnetRef, VlanRef};
use foundry::pipeline::{MachinePipeline, PipelineOutcome, SharedConfig};
use foundry::storage::BlockDevice;
use foundry::workflow::WorkflowEngine;

/// In-memory provisioning service double.
///
/// Machine states evolve by replaying a per-machine script: each
/// `get_machine` pops the next state until only one remains, which then
/// repeats forever.
#[derive(Default)]
struct FakeClient {
    machines: Mutex<HashMap<String, MachineRecord>>,
    state_scripts: Mutex<HashMap<String, VecDeque<MachineState>>>,
    interfaces: Mutex<HashMap<String, Vec<InterfaceDescriptor>>>,
    /// System ids whose `update_machine` is rejected with a 400.
    reject_updates_for: Mutex<HashSet<String>>,
    get_machine_calls: Mutex<HashMap<String, u32>>,
    commission_calls: AtomicU32,
    deploy_calls: AtomicU32,
    bonds_created: Mutex<Vec<BondRequest>>,
    vlans_created: Mutex<Vec<(i64, u16)>>,
    deleted: Mutex<Vec<String>>,
    next_interface_id: AtomicU32,
}

impl FakeClient {
    fn new() -> Self {
        Self {
            next_interface_id: AtomicU32::new(100),
            ..Self::default()
        }
    }

    fn add_machine(&self, system_id: &str, hostname: &str, state: MachineState) {
        self.machines.lock().unwrap().insert(
            system_id.to_string(),
            MachineRecord {
                system_id: system_id.to_string(),
                hostname: hostname.to_string(),
                serial: None,
                mac_addresses: vec![format!("aa:bb:cc:00:00:{:02x}", system_id.len())],
                state,
                power_type: None,
                power_address: None,
            },
        );
    }

    fn script_states(&self, system_id: &str, states: Vec<MachineState>) {
        self.state_scripts
            .lock()
            .unwrap()
            .insert(system_id.to_string(), states.into());
    }

    fn add_interfaces(&self, system_id: &str, interfaces: Vec<InterfaceDescriptor>) {
        self.interfaces
            .lock()
            .unwrap()
            .insert(system_id.to_string(), interfaces);
    }

    fn reject_updates(&self, system_id: &str) {
        self.reject_updates_for
            .lock()
            .unwrap()
            .insert(system_id.to_string());
    }

    fn get_calls(&self, system_id: &str) -> u32 {
        *self
            .get_machine_calls
            .lock()
            .unwrap()
            .get(system_id)
            .unwrap_or(&0)
    }
}

fn semantic_rejection() -> ClientError {
    ClientError::Api {
        status: 400,
        message: "rejected by service".to_string(),
    }
}

#[async_trait]
impl ProvisionClient for FakeClient {
    async fn list_machines(&self) -> Result<Vec<MachineRecord>, ClientError> {
        let mut machines: Vec<MachineRecord> =
            self.machines.lock().unwrap().values().cloned().collect();
        machines.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        Ok(machines)
    }

    async fn get_machine(&self, system_id: &str) -> Result<MachineRecord, ClientError> {
        *self
            .get_machine_calls
            .lock()
            .unwrap()
            .entry(system_id.to_string())
            .or_insert(0) += 1;

        let mut machines = self.machines.lock().unwrap();
        let record = machines
            .get_mut(system_id)
            .ok_or_else(|| ClientError::NotFound(system_id.to_string()))?;

        if let Some(script) = self.state_scripts.lock().unwrap().get_mut(system_id) {
            if script.len() > 1 {
                record.state = script.pop_front().unwrap_or(record.state);
            } else if let Some(&last) = script.front() {
                record.state = last;
            }
        }
        Ok(record.clone())
    }

    async fn create_machine(&self, spec: CreateMachineSpec) -> Result<MachineRecord, ClientError> {
        let system_id = format!("sys-{}", spec.hostname);
        let record = MachineRecord {
            system_id: system_id.clone(),
            hostname: spec.hostname,
            serial: None,
            mac_addresses: spec.mac_addresses,
            state: MachineState::New,
            power_type: spec.power_type,
            power_address: spec.power_parameters.get("power_address").cloned(),
        };
        self.machines
            .lock()
            .unwrap()
            .insert(system_id, record.clone());
        Ok(record)
    }

    async fn update_machine(
        &self,
        system_id: &str,
        update: MachineUpdate,
    ) -> Result<MachineRecord, ClientError> {
        if self.reject_updates_for.lock().unwrap().contains(system_id) {
            return Err(semantic_rejection());
        }

        let mut machines = self.machines.lock().unwrap();
        let record = machines
            .get_mut(system_id)
            .ok_or_else(|| ClientError::NotFound(system_id.to_string()))?;
        if let Some(hostname) = update.hostname {
            record.hostname = hostname;
        }
        if let Some(power_type) = update.power_type {
            record.power_type = Some(power_type);
        }
        Ok(record.clone())
    }

    async fn commission(&self, system_id: &str, _opts: CommissionOpts) -> Result<(), ClientError> {
        self.commission_calls.fetch_add(1, Ordering::SeqCst);
        if !self.machines.lock().unwrap().contains_key(system_id) {
            return Err(ClientError::NotFound(system_id.to_string()));
        }
        Ok(())
    }

    async fn deploy(&self, system_id: &str, _opts: DeployOpts) -> Result<(), ClientError> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        if !self.machines.lock().unwrap().contains_key(system_id) {
            return Err(ClientError::NotFound(system_id.to_string()));
        }
        Ok(())
    }

    async fn release(&self, system_id: &str, _opts: ReleaseOpts) -> Result<(), ClientError> {
        if !self.machines.lock().unwrap().contains_key(system_id) {
            return Err(ClientError::NotFound(system_id.to_string()));
        }
        Ok(())
    }

    async fn delete_machine(&self, system_id: &str) -> Result<(), ClientError> {
        self.machines
            .lock()
            .unwrap()
            .remove(system_id)
            .ok_or_else(|| ClientError::NotFound(system_id.to_string()))?;
        self.deleted.lock().unwrap().push(system_id.to_string());
        Ok(())
    }

    async fn set_boot_order(
        &self,
        _system_id: &str,
        _devices: &[String],
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn list_interfaces(
        &self,
        system_id: &str,
    ) -> Result<Vec<InterfaceDescriptor>, ClientError> {
        Ok(self
            .interfaces
            .lock()
            .unwrap()
            .get(system_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_bond(
        &self,
        _system_id: &str,
        req: BondRequest,
    ) -> Result<InterfaceDescriptor, ClientError> {
        let id = i64::from(self.next_interface_id.fetch_add(1, Ordering::SeqCst));
        let bond = InterfaceDescriptor {
            id,
            name: req.name.clone(),
            kind: InterfaceKind::Bond,
            mac_address: None,
            vlan: None,
            links: Vec::new(),
        };
        self.bonds_created.lock().unwrap().push(req);
        Ok(bond)
    }

    async fn create_vlan_interface(
        &self,
        _system_id: &str,
        parent_id: i64,
        vlan_id: u16,
    ) -> Result<InterfaceDescriptor, ClientError> {
        self.vlans_created.lock().unwrap().push((parent_id, vlan_id));
        let id = i64::from(self.next_interface_id.fetch_add(1, Ordering::SeqCst));
        Ok(InterfaceDescriptor {
            id,
            name: format!("bond0.{vlan_id}"),
            kind: InterfaceKind::Vlan,
            mac_address: None,
            vlan: Some(VlanRef { vid: vlan_id }),
            links: Vec::new(),
        })
    }

    async fn link_subnet(
        &self,
        _system_id: &str,
        _interface_id: i64,
        _mode: LinkMode,
        _subnet_id: i64,
        _ip_address: Option<&str>,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn list_subnets(&self) -> Result<Vec<SubnetRef>, ClientError> {
        Ok(Vec::new())
    }

    async fn list_block_devices(
        &self,
        _system_id: &str,
    ) -> Result<Vec<BlockDevice>, ClientError> {
        Ok(vec![BlockDevice {
            id: 1,
            name: "sda".to_string(),
            id_path: None,
            path: None,
            size: 480_000_000_000,
            tags: vec!["ssd".to_string()],
        }])
    }

    async fn set_storage_config(&self, _system_id: &str, _curtin: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

fn base_config(actions: Vec<Action>, machines: Vec<MachineConfig>) -> WorkflowConfig {
    let mut config: WorkflowConfig = serde_json::from_str(
        r#"{ "api_url": "http://maas.test:5240/MAAS", "api_key": "c:t:s" }"#,
    )
    .expect("static config parses");
    config.actions = ActionSet::from(actions);
    config.machines = machines;
    config
}

fn machine_cfg(hostname: &str) -> MachineConfig {
    MachineConfig {
        hostname: Some(hostname.to_string()),
        power_type: Some("ipmi".to_string()),
        ..MachineConfig::default()
    }
}

fn physical(id: i64, name: &str, vid: u16) -> InterfaceDescriptor {
    InterfaceDescriptor {
        id,
        name: name.to_string(),
        kind: InterfaceKind::Physical,
        mac_address: None,
        vlan: Some(VlanRef { vid }),
        links: Vec::new(),
    }
}

async fn run_pipeline(
    client: &Arc<FakeClient>,
    actions: Vec<Action>,
    cfg: MachineConfig,
) -> PipelineOutcome {
    let config = base_config(actions, vec![cfg.clone()]);
    let shared = Arc::new(SharedConfig::from_workflow(&config));
    let (_tx, rx) = watch::channel(false);
    let client: Arc<dyn ProvisionClient> = client.clone();
    MachinePipeline::new(client, shared, cfg, rx).run().await
}

#[tokio::test(start_paused = true)]
async fn test_delete_returns_absent_system_id() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::Ready);

    let outcome = run_pipeline(&client, vec![Action::Delete], machine_cfg("node01")).await;

    assert!(outcome.is_success());
    // Deliberate contract: processed but removed.
    assert!(outcome.system_id().is_none());
    assert_eq!(client.deleted.lock().unwrap().as_slice(), ["abc001"]);
}

#[tokio::test(start_paused = true)]
async fn test_set_power_returns_system_id_unchanged() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::Ready);

    let outcome = run_pipeline(&client, vec![Action::SetPower], machine_cfg("node01")).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.system_id(), Some("abc001"));
}

#[tokio::test(start_paused = true)]
async fn test_missing_machine_without_create_fails_at_locate() {
    let client = Arc::new(FakeClient::new());

    let outcome = run_pipeline(
        &client,
        vec![Action::FindMachine, Action::SetPower],
        machine_cfg("ghost"),
    )
    .await;

    match outcome {
        PipelineOutcome::Failed { stage, system_id, .. } => {
            assert_eq!(stage.to_string(), "locate");
            assert!(system_id.is_none());
        }
        PipelineOutcome::Completed { .. } => panic!("expected locate failure"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_machine_enlists_when_absent() {
    let client = Arc::new(FakeClient::new());

    let cfg = MachineConfig {
        hostname: Some("node07".to_string()),
        pxe_mac: Some("aa:bb:cc:dd:ee:07".to_string()),
        ..MachineConfig::default()
    };
    let outcome = run_pipeline(&client, vec![Action::CreateMachine], cfg).await;

    assert_eq!(outcome.system_id(), Some("sys-node07"));
    assert!(client.machines.lock().unwrap().contains_key("sys-node07"));
}

async fn run_fleet_with_bad_third_machine(concurrent: bool) {
    let client = Arc::new(FakeClient::new());
    let mut machines = Vec::new();
    for i in 1..=5 {
        let hostname = format!("node{i:02}");
        let system_id = format!("abc{i:03}");
        client.add_machine(&system_id, &hostname, MachineState::Ready);
        machines.push(machine_cfg(&hostname));
    }
    // Machine #3's power update is rejected on every attempt.
    client.reject_updates("abc003");

    let mut config = base_config(vec![Action::FindMachine, Action::SetPower], machines);
    config.concurrent = Some(concurrent);

    let (_tx, rx) = watch::channel(false);
    let service: Arc<dyn ProvisionClient> = client.clone();
    let engine = WorkflowEngine::new(service, config, rx);
    let summary = engine.run().await;

    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);

    // Deterministic input order, every machine reported exactly once.
    let hostnames: Vec<&str> = summary.reports.iter().map(|r| r.hostname.as_str()).collect();
    assert_eq!(hostnames, ["node01", "node02", "node03", "node04", "node05"]);

    let failed: Vec<&str> = summary
        .reports
        .iter()
        .filter(|r| matches!(r.outcome, foundry::report::ReportOutcome::Failed { .. }))
        .map(|r| r.hostname.as_str())
        .collect();
    assert_eq!(failed, ["node03"]);
}

#[tokio::test(start_paused = true)]
async fn test_fleet_isolates_failure_sequential() {
    run_fleet_with_bad_third_machine(false).await;
}

#[tokio::test(start_paused = true)]
async fn test_fleet_isolates_failure_concurrent() {
    run_fleet_with_bad_third_machine(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_create_commission_deploy() {
    let client = Arc::new(FakeClient::new());

    let mut machines = Vec::new();
    for i in 1..=2 {
        let hostname = format!("node{i:02}");
        machines.push(MachineConfig {
            hostname: Some(hostname.clone()),
            pxe_mac: Some(format!("aa:bb:cc:dd:ee:{i:02}")),
            ..MachineConfig::default()
        });
        // Commission wait sees COMMISSIONING twice then READY (one state
        // transition observed); deploy wait sees DEPLOYING then DEPLOYED.
        client.script_states(
            &format!("sys-{hostname}"),
            vec![
                MachineState::Commissioning,
                MachineState::Commissioning,
                MachineState::Ready,
                MachineState::Deploying,
                MachineState::Deployed,
            ],
        );
    }

    let config = base_config(
        vec![Action::CreateMachine, Action::Commission, Action::Deploy],
        machines,
    );

    let (_tx, rx) = watch::channel(false);
    let service: Arc<dyn ProvisionClient> = client.clone();
    let engine = WorkflowEngine::new(service, config, rx);
    let summary = engine.run().await;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(client.commission_calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.deploy_calls.load(Ordering::SeqCst), 2);

    for (i, report) in summary.reports.iter().enumerate() {
        let hostname = format!("node{:02}", i + 1);
        assert_eq!(report.hostname, hostname);
        assert_eq!(report.system_id.as_deref(), Some(&*format!("sys-{hostname}")));
        match &report.outcome {
            foundry::report::ReportOutcome::Completed { final_state } => {
                assert_eq!(*final_state, Some(MachineState::Deployed));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        // 3 reads for the commission wait, 2 for the deploy wait, 1 for
        // the final summary refresh. The poller did not keep reading
        // after READY/DEPLOYED.
        assert_eq!(client.get_calls(&format!("sys-{hostname}")), 6);
    }
}

#[tokio::test(start_paused = true)]
async fn test_bond_stage_creates_bond_and_vlan_subinterfaces() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::Ready);
    client.add_interfaces(
        "abc001",
        vec![
            physical(1, "eth0", 100),
            physical(2, "eth1", 100),
            physical(3, "eth2", 200),
        ],
    );

    let mut cfg = machine_cfg("node01");
    cfg.bonds = vec![BondConfig {
        name: "bond0".to_string(),
        vlan_ids: vec![100, 300],
        mode: foundry::config::BondMode::Lacp,
        mtu: Some(9000),
        lacp_rate: None,
        xmit_hash_policy: None,
        subnet: None,
        ip_mode: LinkMode::Auto,
        ip_address: None,
    }];

    let outcome = run_pipeline(&client, vec![Action::SetNetworkBond], cfg).await;
    assert!(outcome.is_success());

    let bonds = client.bonds_created.lock().unwrap();
    assert_eq!(bonds.len(), 1);
    assert_eq!(bonds[0].name, "bond0");
    assert_eq!(bonds[0].parents, vec![1, 2]);
    assert_eq!(bonds[0].mode, "802.3ad");

    let vlans = client.vlans_created.lock().unwrap();
    assert_eq!(vlans.len(), 1);
    assert_eq!(vlans[0].1, 300);
}

#[tokio::test(start_paused = true)]
async fn test_failing_bond_aborts_stage_but_keeps_earlier_bonds() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::Ready);
    // Only VLAN 100 has two members; VLAN 500 has one.
    client.add_interfaces(
        "abc001",
        vec![
            physical(1, "eth0", 100),
            physical(2, "eth1", 100),
            physical(3, "eth2", 500),
        ],
    );

    let bond = |name: &str, vid: u16| BondConfig {
        name: name.to_string(),
        vlan_ids: vec![vid],
        mode: foundry::config::BondMode::Lacp,
        mtu: None,
        lacp_rate: None,
        xmit_hash_policy: None,
        subnet: None,
        ip_mode: LinkMode::Auto,
        ip_address: None,
    };
    let mut cfg = machine_cfg("node01");
    cfg.bonds = vec![bond("bond0", 100), bond("bond1", 500)];

    let outcome = run_pipeline(&client, vec![Action::SetNetworkBond], cfg).await;

    match outcome {
        PipelineOutcome::Failed { stage, .. } => {
            assert_eq!(stage.to_string(), "network-bonds");
        }
        PipelineOutcome::Completed { .. } => panic!("expected bond stage failure"),
    }
    // bond0 was created before bond1 failed and is not rolled back.
    let bonds = client.bonds_created.lock().unwrap();
    assert_eq!(bonds.len(), 1);
    assert_eq!(bonds[0].name, "bond0");
}

#[tokio::test(start_paused = true)]
async fn test_collection_timeout_reports_machine_failed() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::Ready);
    // The commission wait never leaves COMMISSIONING; the workflow's
    // collection timeout must fire long before the poll timeout.
    client.script_states("abc001", vec![MachineState::Commissioning]);

    let mut cfg = machine_cfg("node01");
    cfg.commission_timeout_secs = 86_400;

    let mut config = base_config(vec![Action::FindMachine, Action::Commission], vec![cfg]);
    config.concurrent = Some(true);
    config.collect_timeout_secs = 30;

    let (_tx, rx) = watch::channel(false);
    let service: Arc<dyn ProvisionClient> = client.clone();
    let engine = WorkflowEngine::new(service, config, rx);
    let summary = engine.run().await;

    assert_eq!(summary.failed, 1);
    match &summary.reports[0].outcome {
        foundry::report::ReportOutcome::Failed { stage, .. } => assert_eq!(stage, "collect"),
        other => panic!("expected collection failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_commission_error_state_fails_stage() {
    let client = Arc::new(FakeClient::new());
    client.add_machine("abc001", "node01", MachineState::New);
    client.script_states(
        "abc001",
        vec![
            MachineState::Commissioning,
            MachineState::FailedCommissioning,
        ],
    );

    let outcome = run_pipeline(
        &client,
        vec![Action::FindMachine, Action::Commission],
        machine_cfg("node01"),
    )
    .await;

    match outcome {
        PipelineOutcome::Failed { stage, system_id, error } => {
            assert_eq!(stage.to_string(), "commission");
            // The machine still exists; only the stage failed.
            assert_eq!(system_id.as_deref(), Some("abc001"));
            assert!(error.to_string().contains("FAILED_COMMISSIONING"));
        }
        PipelineOutcome::Completed { .. } => panic!("expected commission failure"),
    }
}
