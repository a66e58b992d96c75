#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use relay_domain::{MessageId, UnitId, UserId};
use relay_platform::{Author, ChatEvent, PrivateMessage, Tags};
use relay_runtime::adapters::{LoopbackConnector, MemoryTarget, StaticProfiles};
use relay_runtime::config::Timings;
use relay_runtime::health::spawn_health_server;
use relay_runtime::instance::InstanceState;
use relay_runtime::supervisor::{DEFAULT_WATCH_CAPACITY, spawn_watcher};
use relay_runtime::{EmoteCache, FileConfigSource, RelayContext, Supervisor, telemetry};
use tokio::net::TcpListener;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("RELAY_TEST_LOG").is_some() {
			telemetry::init_tracing(Some("debug"));
		}
	});
}

const UNIT: &str = r#"
webhook_url = "https://discord.com/api/webhooks/1/token"
twitch_client_id = "cid"
twitch_username = "relaybot"
oauth_password = "oauth:pw"
channel = "streamer"
send_all_messages = true
"#;

fn message(id: &str, login: &str, text: &str) -> ChatEvent {
	ChatEvent::Message(Box::new(PrivateMessage {
		id: MessageId::new(id).expect("id"),
		channel: "streamer".parse().expect("channel"),
		channel_id: Some(UserId::new("1000").expect("user id")),
		author: Author {
			id: UserId::new(format!("u-{login}")).expect("user id"),
			login: login.to_string(),
			display: login.to_string(),
			badges: Default::default(),
		},
		text: text.to_string(),
		emotes: Vec::new(),
		reply: None,
		tags: Tags::new(),
	}))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
	let reached = tokio::time::timeout(Duration::from_secs(15), async {
		while !check() {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await;
	assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn contents(target: &MemoryTarget) -> Vec<String> {
	target.created().into_iter().map(|m| m.content).collect()
}

fn write(path: &Path, text: &str) {
	std::fs::write(path, text).expect("write file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn units_on_disk_drive_the_relay() {
	init_test_logging();

	let root = tempfile::tempdir().expect("tempdir");
	let units_dir = root.path().join("units");
	let emotes_dir = root.path().join("shared");
	std::fs::create_dir_all(&units_dir).expect("units dir");
	std::fs::create_dir_all(&emotes_dir).expect("emotes dir");

	let unit_path = units_dir.join("alpha.relay.toml");
	let emotes_path = emotes_dir.join("emotes.toml");
	write(&unit_path, UNIT);
	write(&emotes_path, "[emotes]\nKappa = \"<:Kappa:1>\"\n");
	let unit = UnitId::from_path(&unit_path).expect("unit");

	let emotes = Arc::new(EmoteCache::load(&emotes_path).expect("emotes"));
	let connector = Arc::new(LoopbackConnector::new(
		Arc::new(MemoryTarget::new()),
		Arc::new(StaticProfiles::new()),
	));
	let timings = Timings {
		debounce: Duration::from_millis(200),
		settle: Duration::from_millis(10),
		..Timings::default()
	};
	let supervisor = Supervisor::new(RelayContext::new(
		Arc::new(FileConfigSource::new(&units_dir)),
		connector.clone(),
		emotes.clone(),
		timings,
	));
	let health = supervisor.health();

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let base = format!("http://{}", listener.local_addr().expect("addr"));
	spawn_health_server(listener, health.clone());

	let (guard, events) = spawn_watcher(&units_dir, Some(&emotes_path), DEFAULT_WATCH_CAPACITY).expect("watcher");
	let running = tokio::spawn(supervisor.run(events));

	eventually("instance running", || {
		health.instance_states().get(unit.as_str()) == Some(&InstanceState::Running)
	})
	.await;

	let ready = reqwest::get(format!("{base}/readyz")).await.expect("readyz");
	assert_eq!(ready.status(), 200);
	let listing: serde_json::Value = reqwest::get(format!("{base}/instances"))
		.await
		.expect("instances")
		.json()
		.await
		.expect("json");
	assert_eq!(listing[unit.as_str()], "running");

	let chat = connector.chat(&unit);
	let target = connector.target().clone();
	chat.push(message("m1", "alice", "hello Kappa"));
	eventually("first relay", || target.created().len() == 1).await;
	assert_eq!(contents(&target), vec!["hello <:Kappa:1>"]);

	write(&emotes_path, "[emotes]\nKappa = \"<:Kappa:2>\"\n");
	eventually("emote refresh", || emotes.get("Kappa").as_deref() == Some("<:Kappa:2>")).await;

	tokio::time::sleep(Duration::from_millis(300)).await;
	write(&unit_path, &format!("{UNIT}blacklist = [\"alice\"]\n"));
	eventually("reload", || chat.connects() >= 2).await;
	eventually("running again", || {
		health.instance_states().get(unit.as_str()) == Some(&InstanceState::Running) && chat.is_connected()
	})
	.await;

	chat.push(message("m2", "alice", "should be dropped"));
	chat.push(message("m3", "bob", "Kappa from bob"));
	eventually("second relay", || target.created().len() == 2).await;
	assert_eq!(contents(&target), vec!["hello <:Kappa:1>", "<:Kappa:2> from bob"]);

	std::fs::remove_file(&unit_path).expect("remove unit");
	eventually("instance removed", || health.instance_states().is_empty()).await;
	eventually("chat closed", || !chat.is_connected()).await;

	drop(guard);
	tokio::time::timeout(Duration::from_secs(10), running)
		.await
		.expect("supervisor stops with the watcher")
		.expect("supervisor task")
		.expect("supervisor run");
}
