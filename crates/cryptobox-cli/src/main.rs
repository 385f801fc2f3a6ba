use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use cryptobox::{fingerprint_prekey, BoxConfig, CryptoBox, PreKeyBundle};

const USAGE: &str = "\
usage: cbox [--dir DIR] [--config FILE] <command>

commands:
  fingerprint                  local identity fingerprint
  identity                     export the complete identity (hex)
  prekeys START COUNT          generate prekeys, one `id bundle` line each
  last-prekey                  the last-resort prekey bundle
  bundle-fingerprint HEX       fingerprint of a prekey bundle's owner
  init SID BUNDLE_HEX          start session SID from a peer's bundle
  encrypt SID TEXT             encrypt TEXT on session SID (hex output)
  decrypt SID HEX              decrypt a message, creating SID if unknown
  delete SID                   delete session SID

The storage directory defaults to $CBOX_DIR.";

/// Command-line arguments.
#[derive(Debug, PartialEq, Eq)]
struct Args {
    dir: PathBuf,
    config: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>, env_dir: Option<String>) -> anyhow::Result<Args> {
    let mut dir = env_dir.map(PathBuf::from);
    let mut config = None;
    let mut command = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dir" => dir = Some(args.next().context("--dir needs a value")?.into()),
            "--config" => config = Some(args.next().context("--config needs a value")?.into()),
            "-h" | "--help" => bail!("{USAGE}"),
            _ => {
                command.push(arg);
                command.extend(args.by_ref());
            }
        }
    }

    let Some(dir) = dir else {
        bail!("no storage directory, pass --dir or set CBOX_DIR\n\n{USAGE}");
    };
    if command.is_empty() {
        bail!("{USAGE}");
    }
    Ok(Args { dir, config, command })
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BoxConfig> {
    let Some(path) = path else {
        return Ok(BoxConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    Ok(BoxConfig::from_json(&json)?)
}

fn print_bundle(bundle: &PreKeyBundle) {
    println!("{} {}", bundle.prekey_id, hex::encode(bundle.serialize()));
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;
    let cbox = CryptoBox::open_with_config(&args.dir, config)
        .with_context(|| format!("failed to open {}", args.dir.display()))?;

    let command: Vec<&str> = args.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["fingerprint"] => println!("{}", cbox.local_fingerprint()?),
        ["identity"] => println!("{}", hex::encode(cbox.copy_identity()?.as_slice())),
        ["prekeys", start, count] => {
            let start: u16 = start.parse().context("START must be a 16-bit id")?;
            let count: u16 = count.parse().context("COUNT must be a 16-bit number")?;
            for bundle in cbox.new_prekeys(start, count)? {
                print_bundle(&bundle);
            }
        }
        ["last-prekey"] => print_bundle(&cbox.new_last_prekey()?),
        ["bundle-fingerprint", bundle] => {
            let bundle = hex::decode(bundle).context("bundle is not hex")?;
            println!("{}", fingerprint_prekey(&bundle)?);
        }
        ["init", sid, bundle] => {
            let bundle = hex::decode(bundle).context("bundle is not hex")?;
            let session = cbox.session_from_prekey(sid, &bundle)?;
            session.save()?;
            println!("{}", session.remote_fingerprint()?);
        }
        ["encrypt", sid, text] => {
            let session = cbox.get_session(sid)?;
            let cipher = session.encrypt(text.as_bytes())?;
            session.save()?;
            println!("{}", hex::encode(cipher));
        }
        ["decrypt", sid, message] => {
            let message = hex::decode(message).context("message is not hex")?;
            let (session, plaintext) = cbox.session_from_message(sid, &message)?;
            session.save()?;
            println!("{}", String::from_utf8_lossy(&plaintext));
        }
        ["delete", sid] => cbox.delete_session(sid)?,
        _ => bail!("unknown command `{}`\n\n{USAGE}", args.command.join(" ")),
    }

    cbox.close();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = parse_args(std::env::args().skip(1), std::env::var("CBOX_DIR").ok())
        .and_then(|args| {
            tracing::debug!(dir = %args.dir.display(), command = ?args.command, "cbox starting");
            run(&args)
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
