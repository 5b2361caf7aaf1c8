use anyhow::Result;
use loom_cli::config::ControllerConfig;
use loom_cli::controller::{NewNode, NewShape, NodeUpdate, ShapeUpdate};
use loom_cli::Controller;
use loom_discovery::testing::{FakeCompute, FakeConnector};
use loom_discovery::FixedUsage;
use loom_model::{
    actions, ComputeDescriptor, ComputeUsage, LinkEndpoint, LoomError, NioKind, Node, NodeStatus,
    NodeType, PoolKind, ProjectStatus, Protocol, SubModule, TopologyDocument,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

struct Lab {
    controller: Arc<Controller>,
    connector: Arc<FakeConnector>,
    dir: TempDir,
}

fn config(dir: &Path) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.controller.projects_dir = dir.join("projects");
    config.controller.persist_delay = Duration::from_millis(20);
    config.controller.heartbeat = Duration::from_millis(200);
    config
}

fn usage() -> Arc<FixedUsage> {
    Arc::new(FixedUsage(ComputeUsage {
        cpu_usage_percent: 12.5,
        memory_usage_percent: 40.0,
    }))
}

async fn lab(computes: &[&str]) -> Result<Lab> {
    let dir = tempfile::tempdir()?;
    lab_in(dir, config, computes, Arc::new(FakeConnector::new())).await
}

async fn lab_in(
    dir: TempDir,
    configure: impl Fn(&Path) -> ControllerConfig,
    computes: &[&str],
    connector: Arc<FakeConnector>,
) -> Result<Lab> {
    let controller = Controller::with_usage(configure(dir.path()), connector.clone(), usage());
    for id in computes {
        controller
            .add_compute(ComputeDescriptor::new(*id, Protocol::Http, format!("{}.example.com", id), 8000))
            .await?;
    }
    Ok(Lab {
        controller,
        connector,
        dir,
    })
}

fn udp(node: &Node, adapter: u32, port: u32) -> Option<(u16, String, u16)> {
    match &node.adapter(adapter).ok()?.nio(port).ok()??.kind {
        NioKind::Udp { lport, rhost, rport } => Some((*lport, rhost.clone(), *rport)),
        _ => None,
    }
}

#[tokio::test]
async fn concurrent_pool_requests_never_exceed_capacity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let small = |d: &Path| {
        let mut c = config(d);
        c.pools.application_ids = 3;
        c
    };
    let lab = lab_in(dir, small, &["c1"], Arc::new(FakeConnector::new())).await?;
    let p1 = lab.controller.create_project("east").await?;
    let p2 = lab.controller.create_project("west").await?;

    // 1. Four IOU nodes race for three application ids
    let results = futures::future::join_all([
        p1.add_node(NewNode::new("R1", NodeType::Iou, "c1")),
        p1.add_node(NewNode::new("R2", NodeType::Iou, "c1")),
        p2.add_node(NewNode::new("R1", NodeType::Iou, "c1")),
        p2.add_node(NewNode::new("R2", NodeType::Iou, "c1")),
    ])
    .await;

    // 2. Exactly one is turned away, and no id is handed out twice
    let mut ids: Vec<u32> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter_map(|n| n.pool_id)
        .collect();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(LoomError::ResourceExhausted(_))))
        .count();
    assert_eq!(ids.len(), 3);
    assert_eq!(exhausted, 1);
    ids.sort();
    ids.dedup();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(lab.controller.registry().get("c1").await?.node_count, 3);
    Ok(())
}

#[tokio::test]
async fn second_link_on_a_port_conflicts_until_the_first_is_removed() -> Result<()> {
    let lab = lab(&["c1", "c2"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let a = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let b = project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c2")).await?;
    let c = project.add_node(NewNode::new("PC3", NodeType::Vpcs, "c2")).await?;

    // 1. First link binds a UDP tunnel on both ends
    let link = project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(b.node_id, 0, 0))
        .await?;
    let a_now = project.node(a.node_id).await?;
    let b_now = project.node(b.node_id).await?;
    let (a_lport, a_rhost, a_rport) = udp(&a_now, 0, 0).expect("a is wired");
    let (b_lport, b_rhost, b_rport) = udp(&b_now, 0, 0).expect("b is wired");
    assert_eq!((a_rhost.as_str(), a_rport), ("c2.example.com", b_lport));
    assert_eq!((b_rhost.as_str(), b_rport), ("c1.example.com", a_lport));
    assert_eq!(lab.controller.pools().in_use("c1", PoolKind::UdpPort).await, 1);
    assert_eq!(lab.connector.get("c2").unwrap().calls_matching("add_nio"), 1);

    // 2. The same port cannot back a second link
    let err = project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(c.node_id, 0, 0))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{}", err);
    assert_eq!(project.links().await.len(), 1);
    assert!(udp(&project.node(c.node_id).await?, 0, 0).is_none());

    // 3. A missing port is NotFound, a port to itself is refused
    let missing = project
        .add_link(LinkEndpoint::new(c.node_id, 0, 7), LinkEndpoint::new(b.node_id, 0, 0))
        .await
        .unwrap_err();
    assert!(missing.is_not_found(), "{}", missing);
    assert!(project
        .add_link(LinkEndpoint::new(c.node_id, 0, 0), LinkEndpoint::new(c.node_id, 0, 0))
        .await
        .is_err());

    // 4. Removing the link frees the port and its UDP ports
    project.remove_link(link.link_id).await?;
    assert!(udp(&project.node(a.node_id).await?, 0, 0).is_none());
    assert_eq!(lab.controller.pools().in_use("c1", PoolKind::UdpPort).await, 0);
    project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(c.node_id, 0, 0))
        .await?;
    Ok(())
}

#[tokio::test]
async fn link_on_one_compute_uses_loopback() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let a = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let b = project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c1")).await?;
    project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(b.node_id, 0, 0))
        .await?;
    let (lport, rhost, _) = udp(&project.node(a.node_id).await?, 0, 0).unwrap();
    assert_eq!(rhost, "127.0.0.1");
    assert_eq!(lport, 20000);
    Ok(())
}

#[tokio::test]
async fn node_with_links_cannot_be_removed() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let r1 = project.add_node(NewNode::new("R1", NodeType::Dynamips, "c1")).await?;
    let sw = project
        .add_node(NewNode::new("SW1", NodeType::EthernetSwitch, "c1"))
        .await?;
    assert_eq!(r1.pool_id, Some(1));

    project
        .install_submodule(r1.node_id, 0, 0, SubModule::new("WIC-2T", 2))
        .await?;
    let link = project
        .add_link(LinkEndpoint::new(r1.node_id, 0, 16), LinkEndpoint::new(sw.node_id, 0, 3))
        .await?;

    // 1. Refused while linked, nothing changes
    let err = project.remove_node(r1.node_id).await.unwrap_err();
    assert!(err.is_conflict(), "{}", err);
    assert_eq!(project.nodes().await.len(), 2);

    // 2. The linked slot cannot be emptied either
    let err = project.uninstall_submodule(r1.node_id, 0, 0).await.unwrap_err();
    assert!(err.is_conflict(), "{}", err);

    // 3. Once unlinked the node goes and its id returns to the pool
    project.remove_link(link.link_id).await?;
    project.uninstall_submodule(r1.node_id, 0, 0).await?;
    project.remove_node(r1.node_id).await?;
    assert_eq!(lab.controller.pools().in_use("c1", PoolKind::DynamipsId).await, 0);
    let fake = lab.connector.get("c1").unwrap();
    assert_eq!(fake.calls_matching(&format!("delete_node {}", r1.node_id)), 1);
    assert!(project.node(r1.node_id).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn compute_with_nodes_cannot_be_deregistered() -> Result<()> {
    let lab = lab(&[]).await?;
    lab.controller
        .add_compute(ComputeDescriptor::new("c1", Protocol::Http, "example.com", 84))
        .await?;
    let project = lab.controller.create_project("lab").await?;
    let node = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;

    assert!(lab.controller.remove_compute("c1").await.unwrap_err().is_conflict());
    project.remove_node(node.node_id).await?;
    lab.controller.remove_compute("c1").await?;
    assert!(lab.controller.registry().get("c1").await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn failed_node_creation_leaves_nothing_behind() -> Result<()> {
    let connector = Arc::new(FakeConnector::new());
    connector.insert("c1", FakeCompute::new(&[NodeType::Vpcs, NodeType::Iou]));
    let lab = lab_in(tempfile::tempdir()?, config, &["c1"], connector).await?;
    let project = lab.controller.create_project("lab").await?;

    // 1. Unsupported type
    let err = project
        .add_node(NewNode::new("VM1", NodeType::Qemu, "c1"))
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{}", err);

    // 2. Unknown compute
    let err = project
        .add_node(NewNode::new("PC1", NodeType::Vpcs, "nowhere"))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}", err);

    // 3. Compute refuses the create: the pool id and binding are rolled back
    project.add_node(NewNode::new("R0", NodeType::Iou, "c1")).await?;
    lab.connector.get("c1").unwrap().set_reachable(false);
    let err = project
        .add_node(NewNode::new("R1", NodeType::Iou, "c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::Unreachable(_)), "{}", err);
    assert_eq!(project.nodes().await.len(), 1);
    assert_eq!(lab.controller.pools().in_use("c1", PoolKind::ApplicationId).await, 1);
    assert_eq!(lab.controller.registry().get("c1").await?.node_count, 1);

    // 4. Duplicate names are refused
    lab.connector.get("c1").unwrap().set_reachable(true);
    let err = project
        .add_node(NewNode::new("R0", NodeType::Vpcs, "c1"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    Ok(())
}

#[tokio::test]
async fn unreachable_compute_degrades_only_its_nodes() -> Result<()> {
    let lab = lab(&["c1", "c2"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let good = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let bad = project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c2")).await?;
    let link = project
        .add_link(LinkEndpoint::new(good.node_id, 0, 0), LinkEndpoint::new(bad.node_id, 0, 0))
        .await?;
    project.close().await?;
    assert_eq!(project.status(), ProjectStatus::Closed);
    assert_eq!(lab.controller.registry().get("c2").await?.node_count, 0);

    // 1. c2 goes away while the project is closed
    lab.connector.get("c2").unwrap().set_reachable(false);
    let mut queue = lab.controller.notifications().project_queue(project.id());
    queue.get(Duration::ZERO).await;
    project.open().await?;

    // 2. The project still opens; only PC2 is degraded
    assert_eq!(project.status(), ProjectStatus::Opened);
    assert_eq!(project.node(good.node_id).await?.status, NodeStatus::Stopped);
    assert_eq!(project.node(bad.node_id).await?.status, NodeStatus::Degraded);
    assert_eq!(project.links().await.len(), 1);
    assert!(udp(&project.node(good.node_id).await?, 0, 0).is_none());

    let warning = queue.get(Duration::from_secs(1)).await.unwrap();
    assert_eq!(warning.action, actions::LOG_WARNING);
    assert!(warning.event["message"].as_str().unwrap().contains("PC2"));

    // 3. Degraded nodes refuse actions, healthy ones do not
    let err = project.start_node(bad.node_id).await.unwrap_err();
    assert!(matches!(err, LoomError::Unreachable(_)), "{}", err);
    assert_eq!(project.start_node(good.node_id).await?.status, NodeStatus::Started);
    project.stop_all().await?;
    assert_eq!(project.node(good.node_id).await?.status, NodeStatus::Stopped);

    // 4. A capture needs both ends alive, even when the first one is
    let err = project.start_capture(link.link_id, None).await.unwrap_err();
    assert!(matches!(err, LoomError::Unreachable(_)), "{}", err);
    assert!(!project.links().await[0].capturing);
    assert_eq!(lab.connector.get("c1").unwrap().calls_matching("start_capture"), 0);
    Ok(())
}

#[tokio::test]
async fn degraded_nodes_keep_their_compute_registered() -> Result<()> {
    let lab = lab(&["c1", "c2"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let pc1 = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c2")).await?;
    project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c2")).await?;
    project.add_node(NewNode::new("PC3", NodeType::Vpcs, "c1")).await?;
    project.close().await?;

    // 1. Both c2 nodes come back degraded, and c2 still counts them
    lab.connector.get("c2").unwrap().set_reachable(false);
    project.open().await?;
    let degraded = project
        .nodes()
        .await
        .iter()
        .filter(|n| n.status == NodeStatus::Degraded)
        .count();
    assert_eq!(degraded, 2);
    assert_eq!(lab.controller.registry().get("c2").await?.node_count, 2);
    assert!(matches!(lab.controller.remove_compute("c2").await, Err(e) if e.is_conflict()));

    // 2. Removing one degraded node releases only its own reference
    project.remove_node(pc1.node_id).await?;
    assert_eq!(lab.controller.registry().get("c2").await?.node_count, 1);
    assert!(matches!(lab.controller.remove_compute("c2").await, Err(e) if e.is_conflict()));

    // 3. Closing releases the rest
    project.close().await?;
    assert_eq!(lab.controller.registry().get("c2").await?.node_count, 0);
    assert_eq!(lab.controller.registry().get("c1").await?.node_count, 0);
    lab.controller.remove_compute("c2").await?;
    Ok(())
}

#[tokio::test]
async fn links_dropped_on_open_are_saved() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let a = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let b = project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c1")).await?;
    project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(b.node_id, 0, 0))
        .await?;
    project.close().await?;

    // 1. The saved link now points at a port PC2 does not have
    let bytes = std::fs::read(project.file())?;
    let mut doc = TopologyDocument::from_json(&bytes)?;
    doc.topology.links[0].nodes[1].port_number = 9;
    std::fs::write(project.file(), doc.to_json()?)?;

    // 2. Opening drops the link and says the project changed
    let mut queue = lab.controller.notifications().project_queue(project.id());
    queue.get(Duration::ZERO).await;
    project.open().await?;
    assert!(project.links().await.is_empty());
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let n = queue.get(Duration::from_millis(100)).await;
        if n.as_ref().is_some_and(|n| n.action == actions::PROJECT_UPDATED) {
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "project.updated never arrived");
    }

    // 3. The trimmed topology reaches disk without any further mutation
    loop {
        let bytes = tokio::fs::read(project.file()).await?;
        if TopologyDocument::from_json(&bytes)?.topology.links.is_empty() {
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "dropped link was never saved");
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test]
async fn topology_survives_a_restart() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab one").await?;
    let id = project.id();
    let a = project.add_node(NewNode::new("R1", NodeType::Iou, "c1")).await?;
    let b = project.add_node(NewNode::new("R2", NodeType::Iou, "c1")).await?;
    let link = project
        .add_link(LinkEndpoint::new(a.node_id, 1, 2), LinkEndpoint::new(b.node_id, 0, 0))
        .await?;
    project
        .add_shape(NewShape {
            svg: "<svg/>".into(),
            x: 10,
            ..NewShape::default()
        })
        .await?;
    assert!(project.file().ends_with(format!("{}/lab-one.loom", id)));
    lab.controller.shutdown().await;

    // 1. A fresh controller finds the project on disk, closed
    let Lab { dir, connector, .. } = lab;
    let lab = lab_in(dir, config, &["c1"], connector).await?;
    assert_eq!(lab.controller.load_projects_dir().await, 1);
    let listed = lab.controller.list_projects().await;
    assert_eq!(listed[0].name, "lab one");
    assert_eq!(listed[0].status, ProjectStatus::Closed);

    // 2. Opening re-creates nodes with their ids and rewires the link
    let project = lab.controller.open_project(id).await?;
    let nodes = project.nodes().await;
    assert_eq!(nodes.len(), 2);
    assert_eq!(project.node(a.node_id).await?.pool_id, a.pool_id);
    assert_eq!(project.links().await[0].link_id, link.link_id);
    assert!(udp(&project.node(a.node_id).await?, 1, 2).is_some());
    assert_eq!(project.shapes().await[0].x, 10);
    assert_eq!(lab.controller.pools().in_use("c1", PoolKind::ApplicationId).await, 2);
    Ok(())
}

#[tokio::test]
async fn mutations_are_dumped_in_the_background() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let saved = tokio::fs::read_to_string(project.file()).await?;
        if saved.contains("PC1") {
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "node never reached disk");
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!lab.dir.path().join("projects").join(project.id().to_string()).join("lab.loom.tmp").exists());
    Ok(())
}

#[tokio::test]
async fn every_mutation_is_announced_in_order() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let mut queue = lab.controller.notifications().project_queue(project.id());

    // 1. Instant ping with host usage
    let ping = tokio::time::timeout(Duration::from_millis(50), queue.get(Duration::from_secs(60)))
        .await?
        .unwrap();
    assert!(ping.is_ping());
    assert_eq!(ping.event["cpu_usage_percent"], 12.5);

    let a = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let b = project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c1")).await?;
    project
        .update_node(
            a.node_id,
            NodeUpdate {
                name: Some("Gateway".into()),
                ..NodeUpdate::default()
            },
        )
        .await?;
    let link = project
        .add_link(LinkEndpoint::new(a.node_id, 0, 0), LinkEndpoint::new(b.node_id, 0, 0))
        .await?;
    let link = project.start_capture(link.link_id, None).await?;
    let shape = project.add_shape(NewShape::default()).await?;
    project
        .update_shape(
            shape.shape_id,
            ShapeUpdate {
                z: Some(2),
                ..ShapeUpdate::default()
            },
        )
        .await?;
    project.remove_shape(shape.shape_id).await?;

    // 2. In emission order, each carrying the entity
    let mut seen = Vec::new();
    while seen.len() < 8 {
        let n = queue.get(Duration::from_secs(1)).await.unwrap();
        if n.is_ping() {
            continue;
        }
        assert_eq!(n.project_id(), Some(project.id()));
        seen.push(n);
    }
    let actions: Vec<&str> = seen.iter().map(|n| n.action.as_str()).collect();
    assert_eq!(
        actions,
        vec![
            actions::NODE_CREATED,
            actions::NODE_CREATED,
            actions::NODE_UPDATED,
            actions::LINK_CREATED,
            actions::LINK_UPDATED,
            actions::SHAPE_CREATED,
            actions::SHAPE_UPDATED,
            actions::SHAPE_DELETED,
        ]
    );
    assert_eq!(seen[2].event["name"], "Gateway");
    assert_eq!(seen[4].event["capturing"], true);
    assert_eq!(link.capture_file_name.as_deref(), Some("Gateway_0-0_to_PC2_0-0.pcap"));

    // 3. Only one capture per link
    assert!(project.start_capture(link.link_id, None).await.unwrap_err().is_conflict());
    assert!(!project.stop_capture(link.link_id).await?.capturing);
    Ok(())
}

#[tokio::test]
async fn closing_cancels_requests_in_flight() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    let node = project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let fake = lab.connector.get("c1").unwrap();

    fake.set_delay(Duration::from_secs(30));
    let starting = tokio::spawn({
        let project = project.clone();
        async move { project.start_node(node.node_id).await }
    });
    sleep(Duration::from_millis(50)).await;
    fake.set_delay(Duration::ZERO);

    tokio::time::timeout(Duration::from_secs(2), project.close()).await??;
    let result = tokio::time::timeout(Duration::from_secs(2), starting).await??;
    assert!(matches!(result, Err(LoomError::Cancelled(_))), "{:?}", result);
    assert_eq!(fake.calls_matching("close_project"), 1);
    assert!(project.add_node(NewNode::new("PC2", NodeType::Vpcs, "c1")).await.unwrap_err().is_conflict());
    Ok(())
}

#[tokio::test]
async fn deleting_a_project_removes_its_directory() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let project = lab.controller.create_project("lab").await?;
    project.add_node(NewNode::new("PC1", NodeType::Vpcs, "c1")).await?;
    let dir = project.dir().to_path_buf();
    assert!(dir.exists());

    assert!(matches!(lab.controller.create_project("lab").await, Err(e) if e.is_conflict()));
    lab.controller.delete_project(project.id()).await?;
    assert!(!dir.exists());
    assert!(lab.controller.list_projects().await.is_empty());
    assert_eq!(lab.controller.registry().get("c1").await?.node_count, 0);
    Ok(())
}

#[tokio::test]
async fn compute_events_are_folded_into_the_stream() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let mut queue = lab.controller.notifications().queue();
    queue.get(Duration::ZERO).await;

    // 1. A compute ping becomes its usage
    let ping = loom_model::Notification::ping(ComputeUsage {
        cpu_usage_percent: 70.0,
        memory_usage_percent: 30.0,
    });
    lab.controller.handle_compute_notification("c1", ping).await?;
    let usage = lab.controller.registry().get("c1").await?.usage.unwrap();
    assert_eq!(usage.cpu_usage_percent, 70.0);

    // 2. Anything else is forwarded tagged with the compute
    let event = loom_model::Notification::new(actions::LOG_ERROR, serde_json::json!({ "message": "disk full" }));
    lab.controller.handle_compute_notification("c1", event).await?;
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let n = queue.get(Duration::from_millis(100)).await.unwrap();
        if n.action == actions::LOG_ERROR {
            assert_eq!(n.metadata["compute_id"], "c1");
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "forwarded event never arrived");
    }

    // 3. Unknown computes are refused
    let stray = loom_model::Notification::new(actions::LOG_ERROR, serde_json::Value::Null);
    assert!(lab
        .controller
        .handle_compute_notification("c9", stray)
        .await
        .unwrap_err()
        .is_not_found());
    Ok(())
}

#[tokio::test]
async fn compute_feed_reaches_subscribers() -> Result<()> {
    let lab = lab(&["c1"]).await?;
    let fake = lab.connector.get("c1").unwrap();
    let mut queue = lab.controller.notifications().queue();
    queue.get(Duration::ZERO).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while fake.followers() == 0 {
        anyhow::ensure!(Instant::now() < deadline, "compute feed never opened");
        sleep(Duration::from_millis(5)).await;
    }

    // 1. An event pushed by the compute arrives tagged with it
    fake.push(loom_model::Notification::new(
        actions::LOG_ERROR,
        serde_json::json!({ "message": "disk full" }),
    ));
    loop {
        let n = queue.get(Duration::from_millis(100)).await;
        if let Some(n) = n.filter(|n| n.action == actions::LOG_ERROR) {
            assert_eq!(n.metadata["compute_id"], "c1");
            assert_eq!(n.event["message"], "disk full");
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "pushed event never arrived");
    }

    // 2. A pushed ping updates the compute's usage
    fake.push(loom_model::Notification::ping(ComputeUsage {
        cpu_usage_percent: 81.0,
        memory_usage_percent: 5.0,
    }));
    loop {
        let usage = lab.controller.registry().get("c1").await?.usage;
        if usage.is_some_and(|u| u.cpu_usage_percent == 81.0) {
            break;
        }
        anyhow::ensure!(Instant::now() < deadline, "pushed ping never became usage");
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
