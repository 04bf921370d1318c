//! OpenClaw Gateway admin CLI
//!
//! Administrative surface over the state directory: user lifecycle, 2FA
//! enrolment, credentials-file encryption, TLS material and the audit
//! log. Runs as the process owner and operates on the same files as the
//! gateway daemon.
//!
//! Exit codes: 0 on success (including user-cancelled prompts), 1 on
//! domain errors.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Arg, ArgAction, Command};
use rand::Rng;

use openclaw_core::audit;
use openclaw_core::crypto::{self, machine_key, totp};
use openclaw_core::server::tls;
use openclaw_core::store::credentials::CredentialsStore;
use openclaw_core::store::default_state_dir;
use openclaw_core::store::persistence::SessionPersistence;
use openclaw_core::store::sessions::SessionStore;
use openclaw_core::{now_ms, Role};

fn cli() -> Command {
    Command::new("openclaw-admin")
        .version(openclaw_core::VERSION)
        .about("OpenClaw Gateway administration")
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .value_name("DIR")
                .global(true)
                .help("State directory (default ~/.openclaw)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("user")
                .about("User lifecycle")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .about("Create a user")
                        .arg(Arg::new("username").required(true))
                        .arg(
                            Arg::new("role")
                                .long("role")
                                .value_name("ROLE")
                                .help("admin, operator or read-only")
                                .default_value("operator"),
                        ),
                )
                .subcommand(Command::new("list").about("List users"))
                .subcommand(
                    Command::new("delete")
                        .about("Delete a user and revoke their sessions")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("passwd")
                        .about("Set a user's password")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("reset-password")
                        .about("Reset a password with the recovery code")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("rename")
                        .about("Rename a user")
                        .arg(Arg::new("current").required(true))
                        .arg(Arg::new("new").required(true)),
                )
                .subcommand(
                    Command::new("recovery-code")
                        .about("Issue a fresh numeric recovery code")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("revoke")
                        .about("Revoke a user's persisted sessions")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("totp-setup")
                        .about("Enrol a TOTP second factor")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("totp-disable")
                        .about("Remove the TOTP second factor")
                        .arg(Arg::new("username").required(true)),
                )
                .subcommand(
                    Command::new("totp-backup-regenerate")
                        .about("Issue fresh backup codes")
                        .arg(Arg::new("username").required(true)),
                ),
        )
        .subcommand(
            Command::new("credentials")
                .about("Credentials file encryption")
                .subcommand_required(true)
                .subcommand(Command::new("encrypt").about("Encrypt the credentials file"))
                .subcommand(Command::new("decrypt").about("Decrypt the credentials file"))
                .subcommand(Command::new("rotate").about("Rotate the session encryption key")),
        )
        .subcommand(
            Command::new("tls")
                .about("TLS certificate material")
                .subcommand_required(true)
                .subcommand(Command::new("enable").about("Mint certificate material if absent"))
                .subcommand(Command::new("disable").about("Remove certificate material"))
                .subcommand(Command::new("status").about("Report certificate material state"))
                .subcommand(Command::new("regenerate").about("Mint fresh certificate material")),
        )
        .subcommand(
            Command::new("audit")
                .about("Audit log inspection")
                .subcommand_required(true)
                .subcommand(
                    Command::new("tail")
                        .about("Print the latest audit events")
                        .arg(
                            Arg::new("lines")
                                .short('n')
                                .value_name("N")
                                .default_value("20"),
                        )
                        .arg(
                            Arg::new("follow")
                                .short('f')
                                .long("follow")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(Arg::new("json").long("json").action(ArgAction::SetTrue)),
                )
                .subcommand(
                    Command::new("search")
                        .about("Search audit events across rotated files")
                        .arg(Arg::new("event").long("event").value_name("PREFIX"))
                        .arg(Arg::new("actor").long("actor").value_name("NAME"))
                        .arg(
                            Arg::new("since")
                                .long("since")
                                .value_name("DUR|ISO")
                                .help("Duration like 2h/30m/7d, or an ISO-8601 timestamp"),
                        )
                        .arg(Arg::new("json").long("json").action(ArgAction::SetTrue)),
                ),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let state_dir = matches
        .get_one::<String>("state-dir")
        .map(PathBuf::from)
        .unwrap_or_else(default_state_dir);

    let outcome = run(&state_dir, &matches).await;
    match outcome {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(state_dir: &PathBuf, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("user", sub)) => user_command(state_dir, sub).await,
        Some(("credentials", sub)) => credentials_command(state_dir, sub).await,
        Some(("tls", sub)) => tls_command(state_dir, sub),
        Some(("audit", sub)) => audit_command(state_dir, sub),
        _ => unreachable!("subcommand required"),
    }
}

// ------------------------------------------------------------------
// prompting
// ------------------------------------------------------------------

/// Hidden prompt. `None` means the operator cancelled (empty input or EOF).
fn prompt_secret(label: &str) -> Option<String> {
    match rpassword::prompt_password(label) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn prompt_line(label: &str) -> Option<String> {
    print!("{label}");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let trimmed = line.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Prompt for a new password twice; enforces the minimum length.
fn prompt_new_password() -> anyhow::Result<Option<String>> {
    let first = match prompt_secret("New password: ") {
        Some(p) => p,
        None => return Ok(None),
    };
    if first.len() < 8 {
        anyhow::bail!("password must be at least 8 characters");
    }
    let second = match prompt_secret("Repeat password: ") {
        Some(p) => p,
        None => return Ok(None),
    };
    if first != second {
        anyhow::bail!("passwords do not match");
    }
    Ok(Some(first))
}

fn cancelled() -> anyhow::Result<()> {
    println!("Cancelled.");
    Ok(())
}

/// Open the credentials store, prompting for the file password when the
/// file on disk is encrypted.
fn open_credentials(state_dir: &PathBuf) -> anyhow::Result<CredentialsStore> {
    match CredentialsStore::open(state_dir, None) {
        Ok(store) => Ok(store),
        Err(_) => {
            let password = prompt_secret("Credentials file password: ")
                .ok_or_else(|| anyhow::anyhow!("credentials file password required"))?;
            Ok(CredentialsStore::open(state_dir, Some(password))?)
        }
    }
}

// ------------------------------------------------------------------
// user commands
// ------------------------------------------------------------------

async fn user_command(state_dir: &PathBuf, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    let store = open_credentials(state_dir)?;

    match matches.subcommand() {
        Some(("create", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let role = Role::parse(sub.get_one::<String>("role").expect("has default"))
                .ok_or_else(|| anyhow::anyhow!("invalid role; use admin, operator or read-only"))?;
            let password = match prompt_new_password()? {
                Some(p) => p,
                None => return cancelled(),
            };
            let hash = crypto::hash_password(&password)?;
            store.create(username, hash, role).await?;
            println!("Created user {username} ({role})");
            Ok(())
        }
        Some(("list", _)) => {
            let users = store.list().await?;
            if users.is_empty() {
                println!("No users.");
                return Ok(());
            }
            println!("{:<24} {:<10} {:<6} {}", "USERNAME", "ROLE", "2FA", "UPDATED");
            for user in users {
                let updated = DateTime::<Utc>::from_timestamp_millis(user.updated_at as i64)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{:<24} {:<10} {:<6} {}",
                    user.username,
                    user.role,
                    if user.totp_enabled() { "on" } else { "off" },
                    updated,
                );
            }
            Ok(())
        }
        Some(("delete", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            store.delete(username).await?;
            let revoked = revoke_persisted_sessions(state_dir, username).await?;
            println!("Deleted user {username} ({revoked} persisted sessions revoked)");
            Ok(())
        }
        Some(("passwd", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            anyhow::ensure!(store.has(username).await?, "unknown user {username}");
            let password = match prompt_new_password()? {
                Some(p) => p,
                None => return cancelled(),
            };
            store.update_password(username, crypto::hash_password(&password)?).await?;
            println!("Password updated for {username}");
            Ok(())
        }
        Some(("reset-password", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let user = store
                .get(username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown user {username}"))?;
            let recovery_hash = user
                .recovery_code_hash
                .ok_or_else(|| anyhow::anyhow!("no recovery code on file for {username}"))?;

            let presented = match prompt_secret("Recovery code: ") {
                Some(code) => code,
                None => return cancelled(),
            };
            let normalized: String = presented.chars().filter(|c| c.is_ascii_digit()).collect();
            anyhow::ensure!(
                crypto::verify_password(&normalized, &recovery_hash),
                "recovery code does not match"
            );

            let password = match prompt_new_password()? {
                Some(p) => p,
                None => return cancelled(),
            };
            store.update_password(username, crypto::hash_password(&password)?).await?;
            // A recovery code is single-use
            store.update_recovery_code(username, None).await?;
            println!("Password reset for {username}; recovery code consumed");
            Ok(())
        }
        Some(("rename", sub)) => {
            let current = sub.get_one::<String>("current").expect("required");
            let new = sub.get_one::<String>("new").expect("required");
            store.update_username(current, new).await?;
            println!("Renamed {current} to {new}");
            Ok(())
        }
        Some(("recovery-code", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            anyhow::ensure!(store.has(username).await?, "unknown user {username}");

            let code = generate_recovery_code();
            store
                .update_recovery_code(username, Some(crypto::hash_password(&code)?))
                .await?;
            println!("Recovery code for {username} (shown once, store it safely):");
            println!("  {}-{}-{}", &code[0..4], &code[4..8], &code[8..12]);
            Ok(())
        }
        Some(("revoke", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let revoked = revoke_persisted_sessions(state_dir, username).await?;
            println!("Revoked {revoked} persisted sessions for {username}");
            Ok(())
        }
        Some(("totp-setup", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let user = store
                .get(username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown user {username}"))?;
            anyhow::ensure!(!user.totp_enabled(), "2FA is already enabled for {username}");

            let secret = totp::generate_totp_secret();
            let backup_codes = totp::generate_backup_codes();
            let hashes = backup_codes
                .iter()
                .map(|c| crypto::hash_password(c))
                .collect::<Result<Vec<_>, _>>()?;

            println!("Secret (base32): {secret}");
            println!("URI: {}", totp::otpauth_uri(&user.username, &secret));
            println!("Backup codes (shown once):");
            for code in &backup_codes {
                println!("  {code}");
            }
            store.set_totp_pending(&user.username, secret.clone(), hashes).await?;

            let code = match prompt_line("Enter a code from your authenticator to confirm: ") {
                Some(code) => code,
                None => return cancelled(),
            };
            match totp::verify_totp(&secret, &code, None, now_ms() / 1000) {
                Some(matched) => {
                    store.set_last_used_totp_code(&user.username, matched).await?;
                    store.set_totp_enabled(&user.username).await?;
                    println!("2FA enabled for {username}");
                    Ok(())
                }
                None => anyhow::bail!("code did not verify; 2FA left pending"),
            }
        }
        Some(("totp-disable", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let user = store
                .get(username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown user {username}"))?;
            anyhow::ensure!(user.totp_enabled(), "2FA is not enabled for {username}");
            store.clear_totp(&user.username).await?;
            println!("2FA disabled for {username}");
            Ok(())
        }
        Some(("totp-backup-regenerate", sub)) => {
            let username = sub.get_one::<String>("username").expect("required");
            let user = store
                .get(username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("unknown user {username}"))?;
            anyhow::ensure!(user.totp_enabled(), "2FA is not enabled for {username}");

            let backup_codes = totp::generate_backup_codes();
            let hashes = backup_codes
                .iter()
                .map(|c| crypto::hash_password(c))
                .collect::<Result<Vec<_>, _>>()?;
            store.set_backup_code_hashes(&user.username, hashes).await?;
            println!("New backup codes for {username} (shown once):");
            for code in &backup_codes {
                println!("  {code}");
            }
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

/// 12 random digits, hashed at rest like any other credential.
fn generate_recovery_code() -> String {
    let mut rng = rand::thread_rng();
    (0..12).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

/// Rewrite the encrypted session mirror without the named user's
/// sessions. Takes effect in a running daemon at its next restart; live
/// revocation goes through the WebSocket channel.
async fn revoke_persisted_sessions(state_dir: &PathBuf, username: &str) -> anyhow::Result<usize> {
    let key = crypto::MachineKey::load_or_create(state_dir)?;
    let store = SessionStore::new();
    let persistence = SessionPersistence::new(state_dir, key, Arc::clone(&store));

    let outcome = persistence.load();
    let needle = username.to_lowercase();
    let (kept, dropped): (Vec<_>, Vec<_>) = outcome
        .sessions
        .into_iter()
        .partition(|s| s.username.to_lowercase() != needle);
    let removed = dropped.len();

    store.restore(kept).await;
    persistence.flush_sessions().await;
    Ok(removed)
}

// ------------------------------------------------------------------
// credentials commands
// ------------------------------------------------------------------

async fn credentials_command(state_dir: &PathBuf, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("encrypt", _)) => {
            let store = open_credentials(state_dir)?;
            anyhow::ensure!(!store.is_encrypted(), "credentials file is already encrypted");
            let password = match prompt_secret("Encryption password: ") {
                Some(p) => p,
                None => return cancelled(),
            };
            let confirm = match prompt_secret("Repeat password: ") {
                Some(p) => p,
                None => return cancelled(),
            };
            anyhow::ensure!(password == confirm, "passwords do not match");
            store.encrypt_file(&password).await?;
            println!("Credentials file encrypted");
            Ok(())
        }
        Some(("decrypt", _)) => {
            let store = open_credentials(state_dir)?;
            anyhow::ensure!(store.is_encrypted(), "credentials file is not encrypted");
            store.decrypt_file().await?;
            println!("Credentials file decrypted");
            Ok(())
        }
        Some(("rotate", _)) => {
            let rotated = machine_key::rotate_machine_key(state_dir)?;
            println!("Session encryption key rotated ({rotated} sessions re-encrypted)");
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

// ------------------------------------------------------------------
// tls commands
// ------------------------------------------------------------------

fn tls_command(state_dir: &PathBuf, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("enable", _)) => {
            let (cert, _) = tls::ensure_material(state_dir)?;
            println!("TLS material ready at {}", cert.display());
            println!("Start the gateway with --tls to serve HTTPS");
            Ok(())
        }
        Some(("disable", _)) => {
            if tls::remove_material(state_dir)? {
                println!("TLS material removed");
            } else {
                println!("No TLS material present");
            }
            Ok(())
        }
        Some(("status", _)) => {
            if tls::material_exists(state_dir) {
                println!("TLS material present at {}", tls::cert_path(state_dir).display());
            } else {
                println!("No TLS material; run `tls enable`");
            }
            Ok(())
        }
        Some(("regenerate", _)) => {
            let (cert, _) = tls::mint_material(state_dir)?;
            println!("Fresh TLS material minted at {}", cert.display());
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

// ------------------------------------------------------------------
// audit commands
// ------------------------------------------------------------------

fn audit_command(state_dir: &PathBuf, matches: &clap::ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("tail", sub)) => {
            let n: usize = sub
                .get_one::<String>("lines")
                .expect("has default")
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid line count"))?;
            let json = sub.get_flag("json");

            for line in audit::tail_lines(state_dir, n)? {
                print_line(&line, json);
            }

            if sub.get_flag("follow") {
                follow_audit(state_dir, json)?;
            }
            Ok(())
        }
        Some(("search", sub)) => {
            let since = match sub.get_one::<String>("since") {
                Some(raw) => Some(
                    parse_since(raw)
                        .ok_or_else(|| anyhow::anyhow!("invalid --since value {raw:?}"))?,
                ),
                None => None,
            };
            let events = audit::search(
                state_dir,
                sub.get_one::<String>("event").map(String::as_str),
                sub.get_one::<String>("actor").map(String::as_str),
                since,
            )?;
            let json = sub.get_flag("json");
            for event in events {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event);
                }
            }
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

fn print_line(line: &str, json: bool) {
    if json {
        println!("{line}");
        return;
    }
    match serde_json::from_str::<audit::AuditEvent>(line) {
        Ok(event) => print_event(&event),
        Err(_) => println!("{line}"),
    }
}

fn print_event(event: &audit::AuditEvent) {
    println!(
        "{} {:<28} actor={} ip={} {}",
        event.ts, event.event, event.actor, event.ip, event.details
    );
}

/// Poll the live audit file and print lines as they land.
fn follow_audit(state_dir: &PathBuf, json: bool) -> anyhow::Result<()> {
    let path = audit::audit_log_path(state_dir);
    let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if len < offset {
            offset = 0; // rotated underneath us
        }
        if len == offset {
            continue;
        }
        let contents = std::fs::read_to_string(&path)?;
        for line in contents[offset as usize..].lines() {
            if !line.is_empty() {
                print_line(line, json);
            }
        }
        offset = len;
    }
}

/// `--since` accepts `30m` / `2h` / `7d` or an ISO-8601 timestamp.
fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if !raw.is_ascii() {
        return None;
    }
    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: i64 = value.parse().ok()?;
    let duration = match unit {
        "m" => ChronoDuration::minutes(value),
        "h" => ChronoDuration::hours(value),
        "d" => ChronoDuration::days(value),
        _ => return None,
    };
    Some(Utc::now() - duration)
}
