//! `versions` command

use colored::Colorize;
use streamgate_config::KafkaVersion;

pub fn execute() {
    println!("{}", "Supported protocol versions:".bold().cyan());
    for version in KafkaVersion::all() {
        let mut notes = Vec::new();
        if !version.supports_consumer_groups() {
            notes.push("no consumer groups");
        }
        if !version.supports_api_version_request() {
            notes.push("no ApiVersions");
        }
        if version.supports_idempotence() {
            notes.push("idempotence");
        }
        println!("  {:<10} {}", version.as_str().green(), notes.join(", ").dimmed());
    }
}
