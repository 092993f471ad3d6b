//! facefan-enroll: bind a guest's name to their face cluster via a selfie.
//!
//! ## Usage
//!
//! ```bash
//! facefan-enroll --selfie jane.jpg --name "Jane Doe" --phone +15550100
//! facefan-enroll --status        # enrollment summary as JSON
//! ```

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use facefan::analyzer::onnx::OnnxAnalyzer;
use facefan::cloud::CloudManager;
use facefan::config::Config;
use facefan::db::Store;
use facefan::enrollment::{self, EnrollError, EnrollRequest};
use facefan::logging;

struct Args {
    config_path: Option<PathBuf>,
    selfie: Option<PathBuf>,
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    consent: bool,
    status: bool,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        config_path: None,
        selfie: None,
        name: None,
        phone: None,
        email: None,
        consent: true,
        status: false,
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < argv.len() {
                    args.config_path = Some(PathBuf::from(&argv[i + 1]));
                    i += 1;
                }
            }
            "--selfie" | "-s" => {
                if i + 1 < argv.len() {
                    args.selfie = Some(PathBuf::from(&argv[i + 1]));
                    i += 1;
                }
            }
            "--name" => {
                if i + 1 < argv.len() {
                    args.name = Some(argv[i + 1].clone());
                    i += 1;
                }
            }
            "--phone" => {
                if i + 1 < argv.len() {
                    args.phone = Some(argv[i + 1].clone());
                    i += 1;
                }
            }
            "--email" => {
                if i + 1 < argv.len() {
                    args.email = Some(argv[i + 1].clone());
                    i += 1;
                }
            }
            "--no-consent" => {
                args.consent = false;
            }
            "--status" => {
                args.status = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

fn print_help() {
    println!(
        r#"facefan-enroll - register a guest against their face cluster

USAGE:
    facefan-enroll --selfie PATH --name NAME [OPTIONS]
    facefan-enroll --status

OPTIONS:
    --selfie, -s PATH   Selfie image to match against the clusters
    --name NAME         Guest's display name
    --phone PHONE       Optional phone number
    --email EMAIL       Optional email address
    --no-consent        Record that consent was NOT given
    --status            Print the enrollment summary as JSON and exit
    --config, -c PATH   Path to config file
    --help, -h          Show this help message"#
    );
}

fn print_status(store: &Store) -> Result<()> {
    let status = enrollment::enrollment_status(store)?;
    let value = serde_json::json!({
        "total_persons": status.total_persons,
        "total_enrolled": status.total_enrolled,
        "pending_enrollment": status.pending_enrollment,
        "enrollments": status.enrollments.iter().map(|e| serde_json::json!({
            "id": e.id,
            "person_id": e.person_id,
            "user_name": e.user_name,
            "phone": e.phone,
            "email": e.email,
            "match_confidence": e.match_confidence,
            "enrolled_at": e.created_at,
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init_stderr()?;

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let store = Store::open(&config.database.path)?;

    if args.status {
        return print_status(&store);
    }

    let (Some(selfie), Some(name)) = (args.selfie, args.name) else {
        eprintln!("--selfie and --name are required");
        print_help();
        std::process::exit(1);
    };

    // The remote backend is deployment-provided; enrollment still renames
    // the local tree, the store and the queued uploads without one.
    let cloud = Arc::new(CloudManager::disabled());

    let mut analyzer = OnnxAnalyzer::new()?;
    let request = EnrollRequest {
        selfie_path: selfie,
        user_name: name,
        phone: args.phone,
        email: args.email,
        consent_given: args.consent,
    };

    match enrollment::enroll_user(&store, &mut analyzer, &cloud, &config, &request) {
        Ok(enrolled) => {
            println!(
                "Enrolled {} as {} (confidence {:.1}%)",
                request.user_name,
                enrolled.person_name,
                enrolled.match_confidence * 100.0
            );
            println!("Photos: {}", enrolled.solo_dir.parent().unwrap_or(&enrolled.solo_dir).display());
            Ok(())
        }
        Err(EnrollError::NoFace) => {
            eprintln!("No face detected in the selfie. Please use a clear photo of your face.");
            std::process::exit(2);
        }
        Err(EnrollError::NoMatch { best_confidence }) => {
            eprintln!(
                "No confident match yet (best {:.1}%). Event photos may still be processing.",
                best_confidence * 100.0
            );
            std::process::exit(3);
        }
        Err(EnrollError::AlreadyEnrolled { user_name }) => {
            eprintln!("This face cluster is already enrolled under: {user_name}");
            std::process::exit(4);
        }
        Err(e) => Err(e.into()),
    }
}
