// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod cli;

use std::process::exit;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use cpuhp::AdminClient;
use serde_json::Value;

fn request_of(command: &Commands) -> (&'static str, Vec<(String, String)>) {
    let arg = |k: &str, v: String| (k.to_string(), v);
    match command {
        Commands::Status => ("status", vec![]),
        Commands::Clients => ("clients", vec![]),
        Commands::Enable => ("enable", vec![arg("value", "1".into())]),
        Commands::Disable => ("enable", vec![arg("value", "0".into())]),
        Commands::Request { name, mask } => (
            "request",
            vec![arg("name", name.clone()), arg("mask", mask.clone())],
        ),
        Commands::Register { name, mask } => (
            "register",
            vec![arg("name", name.clone()), arg("mask", mask.clone())],
        ),
        Commands::Unregister { name } => ("unregister", vec![arg("name", name.clone())]),
        Commands::Suspend => ("suspend", vec![]),
        Commands::Resume => ("resume", vec![]),
        Commands::QosMax { count } => ("qos_max", vec![arg("value", count.to_string())]),
        Commands::QosMin { count } => ("qos_min", vec![arg("value", count.to_string())]),
    }
}

fn field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn describe_reconcile(v: &Value) -> String {
    match field(v, "state") {
        "applied" => match field(v, "outcome") {
            "applied_partially" => format!(
                "partially applied, cpu{} failed ({}), online {}",
                v["failed_cpu"],
                field(v, "reason"),
                field(v, "online")
            ),
            _ => format!("applied, online {}", field(v, "online")),
        },
        "no_change" => "no change".to_string(),
        "skipped" => format!("skipped ({})", field(v, "reason")),
        state => state.to_string(),
    }
}

fn print_status(v: &Value) {
    println!("enabled       {}", v["enabled"]);
    println!("suspended     {}", v["suspended"]);
    println!("possible      {}", field(v, "possible"));
    println!("online        {}", field(v, "online"));
    println!("last applied  {}", field(v, "last_applied"));
    println!("resolved      {}", field(v, "resolved"));
    println!("clients       {}", v["nr_clients"]);
    println!("reconciles    {} ({} failed)", v["nr_reconciles"], v["nr_failures"]);
}

fn print_clients(v: &Value) {
    println!("{:<16} {:<10} {}", "NAME", "KIND", "MASK");
    for client in v.as_array().into_iter().flatten() {
        println!(
            "{:<16} {:<10} {}",
            field(client, "name"),
            field(client, "kind"),
            field(client, "mask")
        );
    }
}

fn print_response(command: &Commands, v: &Value) {
    match command {
        Commands::Status => print_status(v),
        Commands::Clients => print_clients(v),
        Commands::Enable | Commands::Disable | Commands::Resume => {
            println!("{}", describe_reconcile(v))
        }
        Commands::Register { name, .. } => {
            println!("registered {}: {}", name, describe_reconcile(&v["reconcile"]))
        }
        Commands::Request { .. } | Commands::QosMax { .. } => match v["known"].as_bool() {
            Some(false) => println!("no client named {}, request ignored", field(v, "client")),
            _ => println!(
                "{}: {}",
                field(v, "client"),
                describe_reconcile(&v["reconcile"])
            ),
        },
        Commands::Unregister { .. } | Commands::Suspend | Commands::QosMin { .. } => {
            println!("ok")
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = AdminClient::new().set_path(&cli.socket).connect()?;

    let (req, args) = request_of(&cli.command);
    match client.request(req, args) {
        Ok(v) if cli.json => println!("{}", serde_json::to_string_pretty(&v)?),
        Ok(v) => print_response(&cli.command, &v),
        Err(e) => {
            println!("{} {:#}", "error:".red().bold(), e);
            exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_of() {
        let (req, args) = request_of(&Commands::Disable);
        assert_eq!(req, "enable");
        assert_eq!(args, vec![("value".to_string(), "0".to_string())]);

        let (req, args) = request_of(&Commands::QosMax { count: 4 });
        assert_eq!(req, "qos_max");
        assert_eq!(args, vec![("value".to_string(), "4".to_string())]);
    }

    #[test]
    fn test_describe_reconcile() {
        assert_eq!(describe_reconcile(&json!({"state": "no_change"})), "no change");
        assert_eq!(
            describe_reconcile(&json!({"state": "applied", "outcome": "applied", "online": "0f"})),
            "applied, online 0f"
        );
        assert_eq!(
            describe_reconcile(&json!({
                "state": "applied",
                "outcome": "applied_partially",
                "failed_cpu": 5,
                "reason": "busy",
                "online": "1f"
            })),
            "partially applied, cpu5 failed (busy), online 1f"
        );
        assert_eq!(describe_reconcile(&json!({"state": "suspended"})), "suspended");
    }
}
