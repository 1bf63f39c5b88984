use lockbox::build::{LockboxBuilder, LockboxConfig, DEFAULT_OUTPUT_DIR};
use lockbox::http::{HttpArtifactFetcher, HttpMetadataSource};
use lockbox::remote::{
    ArtifactFetcher, CredentialSource, DisabledArtifactFetcher, FileCredentialSource,
    LocalMetadataSource, MetadataSource, NoOpOwnershipFixer, OwnershipFixer,
};
use lockbox::{LockboxError, RegistryAuth};

use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, Command};
use std::path::Path;

fn cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .subcommand(
            Command::new("build")
                .about("Generate a lockbox for secure offline updates, in a format ready to copy to an SD card or USB stick")
                .after_help(
                    "After the lockbox is generated, the output directory should be copied \
                     (and possibly renamed) to the removable media used for the offline \
                     updates; the name of the directory in the media should be in accordance \
                     with the update client configuration.",
                )
                .arg(
                    Arg::new("lockbox_name")
                        .value_name("LOCKBOX_NAME")
                        .required(true)
                        .help("Name of the lockbox (as defined at the OTA server)"),
                )
                .arg(
                    Arg::new("credentials")
                        .long("credentials")
                        .value_name("FILE")
                        .required(true)
                        .help("File holding the access token for the OTA server"),
                )
                .arg(
                    Arg::new("director-url")
                        .long("director-url")
                        .value_name("URL")
                        .help("Base URL of the director repository"),
                )
                .arg(
                    Arg::new("repo-url")
                        .long("repo-url")
                        .value_name("URL")
                        .help("Base URL of the image repository"),
                )
                .arg(
                    Arg::new("ostree-url")
                        .long("ostree-url")
                        .value_name("URL")
                        .help("Base URL of the OSTree repository"),
                )
                .arg(
                    Arg::new("director-mirror")
                        .long("director-mirror")
                        .value_name("DIR")
                        .help(
                            "Local directory mirroring the director metadata \
                             (takes precedence over --director-url)",
                        ),
                )
                .arg(
                    Arg::new("image-repo-mirror")
                        .long("image-repo-mirror")
                        .value_name("DIR")
                        .help(
                            "Local directory mirroring the image-repository metadata \
                             (takes precedence over --repo-url; --repo-url is still \
                             used for fetching binary targets)",
                        ),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Remove the output directory before generating the lockbox"),
                )
                .arg(
                    Arg::new("platform")
                        .long("platform")
                        .value_name("PLATFORM")
                        .action(ArgAction::Append)
                        .help(format!(
                            "Platform to select for compose targets (can be specified multiple \
                             times; default: {})",
                            lockbox::DEFAULT_PLATFORMS.join(", ")
                        )),
                )
                .arg(
                    Arg::new("login")
                        .long("login")
                        .num_args(2)
                        .value_names(["USERNAME", "PASSWORD"])
                        .help("Log in to the default container registry with USERNAME and PASSWORD"),
                )
                .arg(
                    Arg::new("output-directory")
                        .long("output-directory")
                        .value_name("DIR")
                        .default_value(DEFAULT_OUTPUT_DIR)
                        .help("Path of the output directory"),
                )
                .arg(
                    Arg::new("no-validate")
                        .long("no-validate")
                        .action(ArgAction::SetTrue)
                        .hide(true)
                        .help("Disable basic metadata validation (expiry, cross-checks)"),
                )
                .arg(
                    Arg::new("no-fetch-targets")
                        .long("no-fetch-targets")
                        .action(ArgAction::SetTrue)
                        .hide(true)
                        .help("Fetch only Uptane metadata, no content artifacts"),
                ),
        )
}

fn start() -> Result<(), LockboxError> {
    let matches = cli().get_matches();

    let debug = matches.get_flag("debug");
    let verbose = matches.get_flag("verbose");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else if verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if let Some(matches) = matches.subcommand_matches("build") {
        return run_build(matches);
    }

    Err(LockboxError::Configuration(
        "No command given; try 'lockbox build --help'".to_string(),
    ))
}

fn run_build(matches: &clap::ArgMatches) -> Result<(), LockboxError> {
    let lockbox_name = matches
        .get_one::<String>("lockbox_name")
        .map(|s| s.as_str())
        .unwrap_or_default();
    let output_dir = matches
        .get_one::<String>("output-directory")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_OUTPUT_DIR);
    let fetch_targets = !matches.get_flag("no-fetch-targets");

    let mut registry_auth = Vec::new();
    if let Some(mut login) = matches.get_many::<String>("login") {
        // num_args(2) guarantees both values are present.
        let username = login.next().cloned().unwrap_or_default();
        let password = login.next().cloned().unwrap_or_default();
        registry_auth.push(RegistryAuth {
            registry: None,
            username,
            password,
        });
    }

    let platforms: Vec<String> = match matches.get_many::<String>("platform") {
        Some(values) => values.cloned().collect(),
        None => lockbox::DEFAULT_PLATFORMS
            .iter()
            .map(|p| p.to_string())
            .collect(),
    };

    let config = LockboxConfig {
        force: matches.get_flag("force"),
        validate: !matches.get_flag("no-validate"),
        fetch_targets,
        platforms,
        registry_auth,
    };

    let credentials_path = matches
        .get_one::<String>("credentials")
        .map(|s| s.as_str())
        .unwrap_or_default();
    let credentials = FileCredentialSource::new(credentials_path);

    let metadata_source: Box<dyn MetadataSource> = match (
        matches.get_one::<String>("director-mirror"),
        matches.get_one::<String>("image-repo-mirror"),
        matches.get_one::<String>("director-url"),
        matches.get_one::<String>("repo-url"),
    ) {
        (Some(director), Some(image_repo), _, _) => {
            Box::new(LocalMetadataSource::new(director, image_repo))
        }
        (None, None, Some(director), Some(repo)) => {
            Box::new(HttpMetadataSource::new(director.clone(), repo.clone()))
        }
        _ => {
            return Err(LockboxError::Configuration(
                "Metadata location incomplete: pass both --director-url and --repo-url, \
                 or both --director-mirror and --image-repo-mirror"
                    .to_string(),
            ))
        }
    };

    let fetcher: Box<dyn ArtifactFetcher> = match (
        matches.get_one::<String>("ostree-url"),
        matches.get_one::<String>("repo-url"),
    ) {
        (Some(ostree), Some(repo)) => {
            Box::new(HttpArtifactFetcher::new(ostree.clone(), repo.clone()))
        }
        _ if !fetch_targets => Box::new(DisabledArtifactFetcher),
        _ => {
            return Err(LockboxError::Configuration(
                "Target fetching requires --ostree-url and --repo-url \
                 (or pass --no-fetch-targets)"
                    .to_string(),
            ))
        }
    };

    let ownership = resolve_ownership_fixer();
    let builder = LockboxBuilder::new(
        config,
        &credentials as &dyn CredentialSource,
        metadata_source.as_ref(),
        fetcher.as_ref(),
    )
    .with_ownership_fixer(ownership.as_ref());

    let root = builder.build(lockbox_name, Path::new(output_dir))?;
    println!("Lockbox created at '{}'", root.display());
    Ok(())
}

/// Hand the finished tree back to the invoking user when running via sudo.
fn resolve_ownership_fixer() -> Box<dyn OwnershipFixer> {
    #[cfg(unix)]
    {
        let uid = std::env::var("SUDO_UID").ok().and_then(|v| v.parse().ok());
        let gid = std::env::var("SUDO_GID").ok().and_then(|v| v.parse().ok());
        if let (Some(uid), Some(gid)) = (uid, gid) {
            return Box::new(lockbox::remote::ChownOwnershipFixer::new(uid, gid));
        }
    }
    Box::new(NoOpOwnershipFixer)
}

fn main() -> Result<(), LockboxError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_build_accepts_artifact_urls() {
        // Metadata from local mirrors, artifacts over HTTP.
        let res = cli().try_get_matches_from([
            "lockbox",
            "build",
            "my-lockbox",
            "--credentials",
            "creds.txt",
            "--director-mirror",
            "mirror/director",
            "--image-repo-mirror",
            "mirror/image-repo",
            "--ostree-url",
            "https://ostree.example.com",
            "--repo-url",
            "https://repo.example.com",
        ]);
        assert!(res.is_ok(), "{:?}", res.err());
    }

    #[test]
    fn test_build_requires_credentials() {
        let res = cli().try_get_matches_from(["lockbox", "build", "my-lockbox"]);
        assert!(res.is_err());
    }
}
