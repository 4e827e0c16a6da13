#![forbid(unsafe_code)]

use std::process::ExitCode;

use evhub_client::{ClientConfig, DEFAULT_HUB_SOCKET, HubClient, TopicReply};
use evhub_protocol::{ControlCommand, ControlResult, HubMessage, StatusReport};
use evhub_util::endpoint::IpcEndpoint;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: evhub_ctl [--socket endpoint] [--json] <command> [args]\n\
\n\
Commands:\n\
\tstatus                       Connection, counters, sessions and per-channel state\n\
\tmetrics                      Hub counters only\n\
\tsubscriptions                Desired and active subscriptions\n\
\tresync                       Run a reconciliation pass now\n\
\tdrain | undrain              Stop / resume accepting new consumers\n\
\trestart                      Force one upstream reconnect\n\
\tclear-attention [channel]    Clear needs-attention flags (all channels when omitted)\n\
\tlisten --channel-id id --topic t [--topic t]... [--channel name]\n\
\t                             Act as a consumer and print events\n\
\n\
Options:\n\
\t--socket   Hub endpoint (default: $EVHUB_SOCKET or unix:///tmp/evhub.sock)\n\
\t--json     Print raw reports as JSON\n\
\t--help     Show this help\n"
	);
	std::process::exit(2)
}

enum Command {
	Control(ControlCommand, Option<String>),
	Metrics,
	Listen {
		channel: String,
		channel_id: String,
		topics: Vec<String>,
	},
}

struct Args {
	endpoint: IpcEndpoint,
	json: bool,
	command: Command,
}

fn parse_args() -> Args {
	let mut socket = std::env::var("EVHUB_SOCKET")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.unwrap_or_else(|| DEFAULT_HUB_SOCKET.to_string());
	let mut json = false;
	let mut positional: Vec<String> = Vec::new();
	let mut channel = "evhub_ctl".to_string();
	let mut channel_id: Option<String> = None;
	let mut topics: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--socket" => socket = it.next().unwrap_or_else(|| usage_and_exit()),
			"--json" => json = true,
			"--channel" => channel = it.next().unwrap_or_else(|| usage_and_exit()),
			"--channel-id" => channel_id = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--topic" => topics.push(it.next().unwrap_or_else(|| usage_and_exit())),
			other if other.starts_with("--") => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			_ => positional.push(arg),
		}
	}

	let endpoint = IpcEndpoint::parse(&socket).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let mut positional = positional.into_iter();
	let Some(name) = positional.next() else {
		usage_and_exit();
	};
	let arg = positional.next();
	if positional.next().is_some() {
		eprintln!("too many arguments");
		usage_and_exit();
	}

	let command = match (name.as_str(), arg) {
		("status", None) => Command::Control(ControlCommand::Status, None),
		("metrics", None) => Command::Metrics,
		("subscriptions", None) => Command::Control(ControlCommand::Subscriptions, None),
		("resync", None) => Command::Control(ControlCommand::Resync, None),
		("drain", None) => Command::Control(ControlCommand::Drain, None),
		("undrain", None) => Command::Control(ControlCommand::Undrain, None),
		("restart", None) => Command::Control(ControlCommand::Restart, None),
		("clear-attention", ch) => Command::Control(ControlCommand::ClearAttention, ch),
		("listen", None) => {
			let Some(channel_id) = channel_id else {
				eprintln!("listen requires --channel-id");
				usage_and_exit();
			};
			if topics.is_empty() {
				eprintln!("listen requires at least one --topic");
				usage_and_exit();
			}
			Command::Listen {
				channel,
				channel_id,
				topics,
			}
		}
		(other, _) => {
			eprintln!("Unknown command: {other}");
			usage_and_exit();
		}
	};

	Args {
		endpoint,
		json,
		command,
	}
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn print_json<T: serde::Serialize>(value: &T) {
	match serde_json::to_string_pretty(value) {
		Ok(s) => println!("{s}"),
		Err(e) => eprintln!("failed to encode output: {e}"),
	}
}

fn fmt_ts(ts: Option<i64>) -> String {
	ts.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_counters(status: &StatusReport) {
	let s = &status.state;
	println!("connection:          {}", s.connection);
	println!("last_connect_ts:     {}", fmt_ts(s.last_connect_ts));
	println!("last_reconcile_ts:   {}", fmt_ts(s.last_reconcile_ts));
	println!("reconnect_count:     {}", s.reconnect_count);
	println!("total_events_routed: {}", s.total_events_routed);
	println!("error_burst_level:   {}", s.error_burst_level);
}

fn print_status(status: &StatusReport) {
	print_counters(status);
	println!("desired:             {}", status.desired_count);
	println!("active:              {}", status.active_count);
	println!("draining:            {}", status.draining);

	if !status.sessions.is_empty() {
		println!();
		println!("sessions:");
		for s in &status.sessions {
			println!(
				"  #{:<4} {} ({}) topics=[{}] alive={} last_seen={}s dropped={}",
				s.session_id,
				s.channel,
				s.channel_id,
				s.topics.join(","),
				s.alive,
				s.last_seen_secs_ago,
				s.dropped_events
			);
		}
	}

	if !status.channels.is_empty() {
		println!();
		println!("channels:");
		for c in &status.channels {
			let mut line = format!(
				"  {:<16} desired={} active={} failures={} backoff_level={}",
				c.channel_id, c.desired, c.active, c.failures, c.backoff_level
			);
			if let Some(until) = c.backing_off_until {
				line.push_str(&format!(" backing_off_until={until}"));
			}
			if let Some(reason) = &c.needs_attention {
				line.push_str(&format!(" needs_attention=\"{reason}\""));
			}
			println!("{line}");
		}
	}
}

fn print_result(result: &ControlResult, json: bool) {
	if json {
		print_json(result);
		return;
	}

	if !result.detail.is_empty() {
		println!("{}", result.detail);
	}
	if let Some(status) = &result.status {
		print_status(status);
	}
	if let Some(subs) = &result.subscriptions {
		println!("desired ({}):", subs.desired.len());
		for d in &subs.desired {
			match &d.needs_attention {
				Some(reason) => println!("  {}/{}  needs_attention=\"{reason}\"", d.channel_id, d.topic),
				None => println!("  {}/{}", d.channel_id, d.topic),
			}
		}
		println!("active ({}):", subs.active.len());
		for a in &subs.active {
			println!("  {}/{}  {}  {}", a.channel_id, a.topic, a.status, a.provider_subscription_id);
		}
	}
	if let Some(pass) = &result.pass {
		println!(
			"created={} deleted={} revalidated={} create_failures={} delete_failures={} skipped_backoff={} skipped_attention={} remaining_create={} remaining_delete={} duration_ms={}",
			pass.created,
			pass.deleted,
			pass.revalidated,
			pass.create_failures,
			pass.delete_failures,
			pass.skipped_backoff,
			pass.skipped_attention,
			pass.remaining_to_create,
			pass.remaining_to_delete,
			pass.duration_ms
		);
	}
}

async fn listen(client: &mut HubClient, channel: &str, channel_id: &str, topics: &[String]) -> Result<(), String> {
	let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
	let replies = client.hello(channel, channel_id, &topics).await.map_err(|e| e.to_string())?;

	let mut any_ok = false;
	for r in &replies {
		match r {
			TopicReply::Acked { topic, status } => {
				any_ok = true;
				eprintln!("subscribed {channel_id}/{topic} ({status:?})");
			}
			TopicReply::Rejected { topic, code, detail } => eprintln!("rejected {topic}: {code}: {detail}"),
		}
	}
	if !any_ok {
		return Err("no topic was accepted".to_string());
	}

	loop {
		match client.next_message_keepalive().await.map_err(|e| e.to_string())? {
			Some(HubMessage::Event {
				channel_id,
				topic,
				event_id,
				payload,
			}) => println!("[{channel_id} {topic} {event_id}] {payload}"),
			Some(HubMessage::Lagged { dropped }) => eprintln!("lagged: {dropped} event(s) dropped"),
			Some(other) => eprintln!("{other:?}"),
			None => return Err("hub closed the connection".to_string()),
		}
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig {
		retry_attempts: 1,
		..ClientConfig::default()
	};
	let mut client = match HubClient::connect_with(&args.endpoint, cfg).await {
		Ok(c) => c,
		Err(e) => {
			eprintln!("hub unreachable at {}: {e}", args.endpoint);
			return ExitCode::from(1);
		}
	};

	match args.command {
		Command::Listen {
			channel,
			channel_id,
			topics,
		} => match listen(&mut client, &channel, &channel_id, &topics).await {
			Ok(()) => ExitCode::SUCCESS,
			Err(e) => {
				eprintln!("{e}");
				ExitCode::from(1)
			}
		},
		Command::Metrics => match client.control(ControlCommand::Status, None).await {
			Ok(ControlResult {
				ok: true,
				status: Some(status),
				..
			}) => {
				if args.json {
					print_json(&status.state);
				} else {
					print_counters(&status);
				}
				ExitCode::SUCCESS
			}
			Ok(r) => {
				eprintln!("status failed: {}", r.detail);
				ExitCode::from(1)
			}
			Err(e) => {
				eprintln!("status failed: {e}");
				ExitCode::from(1)
			}
		},
		Command::Control(command, channel_id) => match client.control(command, channel_id.as_deref()).await {
			Ok(r) if r.ok => {
				print_result(&r, args.json);
				ExitCode::SUCCESS
			}
			Ok(r) => {
				if args.json {
					print_json(&r);
				}
				eprintln!("{} failed: {}", command.as_str(), r.detail);
				ExitCode::from(1)
			}
			Err(e) => {
				eprintln!("{} failed: {e}", command.as_str());
				ExitCode::from(1)
			}
		},
	}
}
