// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod config;

use clap::Args;
use clap::Parser;
use config::ToolConfig;
use firmware_mfci::platform::reset::PlatformReset;
use firmware_mfci::platform::rng::OsRandom;
use firmware_mfci::service::notify::NotifyError;
use firmware_mfci::service::notify::PolicyCallbackError;
use firmware_mfci::service::nvram::VariableError;
use firmware_mfci::service::nvram::VariableServices;
use firmware_mfci::service::variables::read_blob_variable;
use firmware_mfci::service::variables::read_u64_variable;
use firmware_mfci::service::variables::write_blob_variable;
use firmware_mfci::MfciError;
use firmware_mfci::MfciManager;
use firmware_mfci::MfciRuntimeDeps;
use mfci_nvram_storage::json_file::JsonFileNvram;
use mfci_nvram_storage::NvramStorageError;
use mfci_policy_blob::pkcs7::sign_policy;
use mfci_policy_blob::pkcs7::OpensslPkcs7Verifier;
use mfci_policy_blob::policy::MfciPolicyFields;
use mfci_policy_blob::policy::PayloadError;
use mfci_policy_blob::policy::PolicyPayload;
use mfci_policy_blob::validate_blob_with_certificates;
use mfci_policy_blob::xdr::encode_xdr;
use mfci_specs::mfci::*;
use mfci_specs::uefi::EfiResetType;
use mfci_specs::Guid;
use openssl::pkey::PKey;
use openssl::x509::X509;
use std::cell::Cell;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
enum Error {
    #[error("config file IO")]
    ConfigFile(#[source] std::io::Error),
    #[error("JSON parsing")]
    SerdeJson(#[from] serde_json::Error),
    #[error("data file IO")]
    DataFile(#[source] std::io::Error),
    #[error("NVRAM storage")]
    NvramStorage(#[from] NvramStorageError),
    #[error("variable access")]
    Variable(#[from] VariableError),
    #[error("MFCI policy check")]
    Mfci(#[from] MfciError),
    #[error("policy change registration")]
    Notify(#[from] NotifyError),
    #[error("certificate or key")]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("policy payload")]
    Payload(#[from] PayloadError),
    #[error("no target nonce has been issued, boot the device first")]
    NoNonce,
    #[error("no value for targeting field {0}, set it in the config or on the command line")]
    MissingTarget(TargetingField),
    #[error("nothing to write, specify `--output` and/or `--config`")]
    NoDestination,
}

#[derive(Args)]
struct NvramPathArg {
    /// JSON file holding the device's variables
    #[clap(short = 'n', long)]
    nvram: PathBuf,
}

#[derive(Args)]
struct ConfigPathArg {
    /// Device configuration file (trust anchors and identity)
    #[clap(short = 'c', long)]
    config: PathBuf,
}

#[derive(Args)]
struct TargetArgs {
    #[clap(long)]
    manufacturer: Option<String>,
    #[clap(long)]
    product: Option<String>,
    #[clap(long)]
    serial_number: Option<String>,
    #[clap(long)]
    oem1: Option<String>,
    #[clap(long)]
    oem2: Option<String>,
}

impl TargetArgs {
    fn get(&self, field: TargetingField) -> &Option<String> {
        match field {
            TargetingField::Manufacturer => &self.manufacturer,
            TargetingField::Product => &self.product,
            TargetingField::SerialNumber => &self.serial_number,
            TargetingField::Oem1 => &self.oem1,
            TargetingField::Oem2 => &self.oem2,
        }
    }
}

#[derive(Parser)]
#[clap(name = "mfcitool", about = "Tool to exercise MFCI policies on a simulated device.")]
enum Options {
    /// Run one boot's policy check against the device.
    ///
    /// Provisions the targeting variables and target nonce on first use, and
    /// installs a staged policy if it verifies.
    Boot {
        #[command(flatten)]
        nvram: NvramPathArg,
        #[command(flatten)]
        config: ConfigPathArg,
    },
    /// Print the device's MFCI variables.
    Show {
        #[command(flatten)]
        nvram: NvramPathArg,
        /// Verify and decode the policy blobs against this configuration
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Stage a signed policy blob for the next boot.
    Stage {
        #[command(flatten)]
        nvram: NvramPathArg,
        /// Signed policy blob
        #[clap(short = 'b', long)]
        blob: PathBuf,
    },
    /// Build an unsigned policy payload.
    ///
    /// Targeting values default to the identity in `config`.
    MakePolicy {
        /// Output payload path
        #[clap(short = 'o', long)]
        output: PathBuf,
        /// Policy state, e.g. 0x2
        #[clap(long, value_parser = parse_u64)]
        policy: u64,
        /// Request a Secure Boot clear on the transition boot
        #[clap(long)]
        secure_boot_clear: bool,
        /// Request a TPM clear on the transition boot
        #[clap(long)]
        tpm_clear: bool,
        /// Target nonce. Read from `nvram` when not given.
        #[clap(long, value_parser = parse_u64, required_unless_present = "nvram")]
        nonce: Option<u64>,
        /// JSON file holding the device's variables
        #[clap(short = 'n', long)]
        nvram: Option<PathBuf>,
        /// Device configuration file
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Sign a policy payload as PKCS#7 with the payload attached.
    Sign {
        /// Unsigned payload path
        #[clap(short = 'p', long)]
        payload: PathBuf,
        /// Signer certificate (PEM)
        #[clap(long)]
        cert: PathBuf,
        /// Signer private key (PEM)
        #[clap(long)]
        key: PathBuf,
        /// Additional certificates to include (PEM)
        #[clap(long)]
        chain: Vec<PathBuf>,
        /// Output blob path
        #[clap(short = 'o', long)]
        output: PathBuf,
    },
    /// Pack trust anchor certificates into an XDR container, in order.
    MakeXdr {
        /// Certificate (PEM or DER). May be repeated.
        #[clap(long, required = true)]
        cert: Vec<PathBuf>,
        /// Output container path
        #[clap(short = 'o', long)]
        output: Option<PathBuf>,
        /// Store the container as this configuration file's trust anchors
        #[clap(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

fn parse_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = do_main() {
        eprintln!("ERROR: {}", e);
        let mut error_source = std::error::Error::source(&e);
        while let Some(e2) = error_source {
            eprintln!("- {}", e2);
            error_source = e2.source();
        }
        std::process::exit(1);
    }
}

fn do_main() -> Result<(), Error> {
    let opt = Options::parse();

    match opt {
        Options::Boot { nvram, config } => boot(&nvram.nvram, &config.config),
        Options::Show { nvram, config } => show(&nvram.nvram, config.as_deref()),
        Options::Stage { nvram, blob } => stage(&nvram.nvram, &blob),
        Options::MakePolicy {
            output,
            policy,
            secure_boot_clear,
            tpm_clear,
            nonce,
            nvram,
            config,
            target,
        } => {
            let mut policy = MfciPolicy(policy);
            if secure_boot_clear {
                policy.0 |= MfciPolicy::STD_ACTION_SECURE_BOOT_CLEAR;
            }
            if tpm_clear {
                policy.0 |= MfciPolicy::STD_ACTION_TPM_CLEAR;
            }
            make_policy(
                &output,
                policy,
                nonce,
                nvram.as_deref(),
                config.as_deref(),
                &target,
            )
        }
        Options::Sign {
            payload,
            cert,
            key,
            chain,
            output,
        } => sign(&payload, &cert, &key, &chain, &output),
        Options::MakeXdr {
            cert,
            output,
            config,
        } => make_xdr(&cert, output.as_deref(), config.as_deref()),
    }
}

fn open_variables(path: &Path) -> Result<VariableServices<JsonFileNvram>, Error> {
    Ok(VariableServices::new(JsonFileNvram::open(path)?))
}

/// Reset that records the request. The next `boot` invocation is the next
/// boot.
struct ToolReset(Rc<Cell<bool>>);

impl PlatformReset for ToolReset {
    fn reset_system(&mut self, reset_type: EfiResetType, subtype: Guid) {
        tracing::info!(?reset_type, %subtype, "reset requested");
        self.0.set(true);
    }
}

fn boot(nvram_path: &Path, config_path: &Path) -> Result<(), Error> {
    let config = ToolConfig::load(config_path)?;
    let vars = open_variables(nvram_path)?;
    let reset_requested = Rc::new(Cell::new(false));

    let deps = MfciRuntimeDeps {
        device_id: Box::new(config.identity),
        reset: Box::new(ToolReset(reset_requested.clone())),
        rng: Box::new(OsRandom),
        verifier: Box::new(OpensslPkcs7Verifier),
    };
    let mut manager = MfciManager::new(vars, deps, config.mfci);
    eprintln!("Policy at boot: {}", manager.current_policy());

    manager
        .register_policy_change_callback(Box::new(
            |new: MfciPolicy, previous: MfciPolicy| -> Result<(), PolicyCallbackError> {
                eprintln!("Policy change: {} -> {}", previous, new);
                if new.actions() != 0 {
                    eprintln!("Actions requested: {:#x}", new.actions());
                }
                Ok(())
            },
        ))?;

    let result = manager.verify_policy_and_change();
    manager.on_ready_to_boot();

    match result {
        Err(MfciError::ResetReturned) if reset_requested.get() => {
            eprintln!("Reset requested, run `boot` again to continue");
            Ok(())
        }
        result => {
            result?;
            eprintln!("Booting with policy: {}", manager.current_policy());
            Ok(())
        }
    }
}

fn print_u64(vars: &mut VariableServices<JsonFileNvram>, name: &'static str) {
    match read_u64_variable(vars, name) {
        Ok(value) => println!("{name}: {value:#018x}"),
        Err(e) if e.is_not_found() => println!("{name}: <not set>"),
        Err(e) => println!("{name}: <{e}>"),
    }
}

fn show(nvram_path: &Path, config_path: Option<&Path>) -> Result<(), Error> {
    let config = config_path.map(ToolConfig::load).transpose()?;
    let mut vars = open_variables(nvram_path)?;

    for field in TargetingField::ALL {
        let value = match vars.read_variable(MFCI_VAR_VENDOR_GUID, field.variable_name()) {
            Ok((_, data)) => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .take_while(|&c| c != 0)
                    .collect();
                format!("{:?}", String::from_utf16_lossy(&units))
            }
            Err(VariableError::NotFound) => "<not set>".into(),
            Err(e) => return Err(e.into()),
        };
        println!("{field}: {value}");
    }

    print_u64(&mut vars, CURRENT_MFCI_POLICY_VARIABLE_NAME);
    print_u64(&mut vars, CURRENT_MFCI_NONCE_VARIABLE_NAME);
    print_u64(&mut vars, NEXT_MFCI_NONCE_VARIABLE_NAME);

    for name in [
        CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME,
        NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME,
    ] {
        let blob = match read_blob_variable(&mut vars, name) {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => {
                println!("{name}: <not set>");
                continue;
            }
            Err(e) => {
                println!("{name}: <{e}>");
                continue;
            }
        };
        println!("{name}: {} bytes", blob.len());

        let Some(config) = &config else { continue };
        let required_ekus: Vec<&str> = config.mfci.required_ekus.iter().map(String::as_str).collect();
        match validate_blob_with_certificates(
            &OpensslPkcs7Verifier,
            &blob,
            &config.mfci.trust_anchors,
            &required_ekus,
        ) {
            Ok(payload) => {
                let fields = MfciPolicyFields::from_payload(&PolicyPayload::parse(&payload)?)?;
                println!("  {fields:#?}");
            }
            Err(e) => println!("  signature: <{e}>"),
        }
    }

    Ok(())
}

fn stage(nvram_path: &Path, blob_path: &Path) -> Result<(), Error> {
    let blob = fs_err::read(blob_path).map_err(Error::DataFile)?;
    let mut vars = open_variables(nvram_path)?;
    write_blob_variable(&mut vars, NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME, blob)?;
    eprintln!("Staged {}", blob_path.display());
    Ok(())
}

fn make_policy(
    output: &Path,
    policy: MfciPolicy,
    nonce: Option<u64>,
    nvram_path: Option<&Path>,
    config_path: Option<&Path>,
    target: &TargetArgs,
) -> Result<(), Error> {
    let nonce = match (nonce, nvram_path) {
        (Some(nonce), _) => nonce,
        (None, Some(path)) => {
            let mut vars = open_variables(path)?;
            match read_u64_variable(&mut vars, NEXT_MFCI_NONCE_VARIABLE_NAME) {
                Ok(MFCI_POLICY_INVALID_NONCE) => return Err(Error::NoNonce),
                Ok(nonce) => nonce,
                Err(e) if e.is_not_found() => return Err(Error::NoNonce),
                Err(e) => return Err(e.into()),
            }
        }
        (None, None) => return Err(Error::NoNonce),
    };

    let identity = config_path
        .map(ToolConfig::load)
        .transpose()?
        .unwrap_or_default()
        .identity;

    let mut fields = MfciPolicyFields {
        nonce,
        policy,
        ..Default::default()
    };
    for field in TargetingField::ALL {
        let from_config = match field {
            TargetingField::Manufacturer => &identity.manufacturer,
            TargetingField::Product => &identity.product,
            TargetingField::SerialNumber => &identity.serial_number,
            TargetingField::Oem1 => &identity.oem1,
            TargetingField::Oem2 => &identity.oem2,
        };
        *fields.targeting_mut(field) = target
            .get(field)
            .as_ref()
            .or(from_config.as_ref())
            .ok_or(Error::MissingTarget(field))?
            .clone();
    }

    fs_err::write(output, fields.to_payload()).map_err(Error::DataFile)?;
    eprintln!("Wrote policy {} for nonce {:#x}", policy, nonce);
    Ok(())
}

fn sign(
    payload_path: &Path,
    cert_path: &Path,
    key_path: &Path,
    chain_paths: &[PathBuf],
    output: &Path,
) -> Result<(), Error> {
    let payload = fs_err::read(payload_path).map_err(Error::DataFile)?;
    let cert = X509::from_pem(&fs_err::read(cert_path).map_err(Error::DataFile)?)?;
    let key = PKey::private_key_from_pem(&fs_err::read(key_path).map_err(Error::DataFile)?)?;
    let chain = chain_paths
        .iter()
        .map(|path| Ok(X509::from_pem(&fs_err::read(path).map_err(Error::DataFile)?)?))
        .collect::<Result<Vec<_>, Error>>()?;

    let blob = sign_policy(&payload, &cert, &key, &chain)?;
    fs_err::write(output, blob).map_err(Error::DataFile)?;
    Ok(())
}

fn make_xdr(
    cert_paths: &[PathBuf],
    output: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<(), Error> {
    if output.is_none() && config_path.is_none() {
        return Err(Error::NoDestination);
    }

    let mut certs = Vec::new();
    for path in cert_paths {
        let data = fs_err::read(path).map_err(Error::DataFile)?;
        let cert = X509::from_pem(&data).or_else(|_| X509::from_der(&data))?;
        certs.push(cert.to_der()?);
    }
    let container = encode_xdr(certs.iter().map(Vec::as_slice));

    if let Some(output) = output {
        fs_err::write(output, &container).map_err(Error::DataFile)?;
    }
    if let Some(path) = config_path {
        let mut config = ToolConfig::load_or_default(path)?;
        config.mfci.trust_anchors = container;
        config.save(path)?;
    }
    Ok(())
}
