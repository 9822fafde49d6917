//! Certificate authority for per-instance mutual TLS
//!
//! One long-lived CA lives under `<data>/ca`. Every instance gets a server
//! certificate for its database process and a client certificate for whoever
//! provisioned it, both signed by that CA and both carrying the common name
//! `draupnir-instance-<id>`. The database maps that name to its superuser, so a
//! client certificate only ever opens the instance it was issued for.

use chrono::{DateTime, Utc};
use draupnir_common::{
    ClientKey, CredentialRecord, DraupnirError, InstanceId, IssuedCredential, Result,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{info, instrument};

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct CaConfig {
    pub common_name: String,
    /// Lifetime of issued leaf certificates
    pub validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "Draupnir CA".to_string(),
            validity_days: 30,
        }
    }
}

/// Key material an instance's database server needs for TLS.
#[derive(Clone)]
pub struct ServerTls {
    pub certificate: String,
    pub private_key: String,
    pub ca_certificate: String,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls")
            .field("certificate", &self.certificate)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

pub fn common_name_for(instance_id: InstanceId) -> String {
    format!("draupnir-instance-{instance_id}")
}

pub struct CertificateAuthority {
    certificate: Certificate,
    key: KeyPair,
    /// PEM as persisted; handed to clients as the trust anchor
    certificate_pem: String,
    config: CaConfig,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, creating and persisting a new one on first use.
    pub async fn load_or_create(dir: impl AsRef<Path>, config: CaConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let cert_exists = fs::try_exists(&cert_path).await?;
        let key_exists = fs::try_exists(&key_path).await?;
        match (cert_exists, key_exists) {
            (true, true) => {
                let certificate_pem = fs::read_to_string(&cert_path).await?;
                let key_pem = fs::read_to_string(&key_path).await?;
                let key = KeyPair::from_pem(&key_pem).map_err(|e| corrupted("CA key", e))?;
                let params = CertificateParams::from_ca_cert_pem(&certificate_pem)
                    .map_err(|e| corrupted("CA certificate", e))?;
                let certificate = params
                    .self_signed(&key)
                    .map_err(|e| corrupted("CA certificate", e))?;
                info!(dir = %dir.display(), "loaded certificate authority");
                Ok(Self {
                    certificate,
                    key,
                    certificate_pem,
                    config,
                })
            }
            (false, false) => {
                let key = KeyPair::generate().map_err(internal)?;
                let mut params = CertificateParams::default();
                let mut dn = DistinguishedName::new();
                dn.push(DnType::CommonName, config.common_name.clone());
                params.distinguished_name = dn;
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
                params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
                params.not_after = params.not_before + Duration::days(CA_VALIDITY_DAYS);
                params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

                let certificate = params.self_signed(&key).map_err(internal)?;
                let certificate_pem = certificate.pem();
                write_private(&key_path, &key.serialize_pem()).await?;
                fs::write(&cert_path, &certificate_pem).await?;
                info!(dir = %dir.display(), common_name = %config.common_name, "created certificate authority");
                Ok(Self {
                    certificate,
                    key,
                    certificate_pem,
                    config,
                })
            }
            _ => Err(DraupnirError::Corrupted(format!(
                "incomplete certificate authority in {}: expected both {CA_CERT_FILE} and {CA_KEY_FILE}",
                dir.display()
            ))),
        }
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Issue a client certificate that authenticates to `instance_id` only.
    ///
    /// The private key is returned once inside [`IssuedCredential`] and is not
    /// retained anywhere.
    #[instrument(skip(self))]
    pub fn issue_client(&self, instance_id: InstanceId) -> Result<IssuedCredential> {
        let (issued_at, not_before) = now_to_second()?;
        let expires_at = issued_at + chrono::Duration::days(i64::from(self.config.validity_days));

        let mut params = self.leaf_params(instance_id, not_before);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let key = KeyPair::generate().map_err(internal)?;
        let certificate = params
            .signed_by(&key, &self.certificate, &self.key)
            .map_err(internal)?;

        let record = CredentialRecord {
            id: instance_id,
            serial: hex::encode(&serial),
            fingerprint: fingerprint(certificate.der()),
            ca_certificate: self.certificate_pem.clone(),
            client_certificate: certificate.pem(),
            issued_at,
            expires_at,
        };
        info!(serial = %record.serial, fingerprint = %record.fingerprint, "issued client certificate");

        Ok(IssuedCredential {
            record,
            client_key: ClientKey::new(key.serialize_pem()),
        })
    }

    /// Issue the certificate the instance's database presents to clients.
    #[instrument(skip(self))]
    pub fn issue_server(&self, instance_id: InstanceId, hostname: &str) -> Result<ServerTls> {
        let (_, not_before) = now_to_second()?;
        let mut params = self.leaf_params(instance_id, not_before);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = vec![subject_alt_name(hostname)?];
        params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

        let key = KeyPair::generate().map_err(internal)?;
        let certificate = params
            .signed_by(&key, &self.certificate, &self.key)
            .map_err(internal)?;

        Ok(ServerTls {
            certificate: certificate.pem(),
            private_key: key.serialize_pem(),
            ca_certificate: self.certificate_pem.clone(),
        })
    }

    fn leaf_params(&self, instance_id: InstanceId, not_before: OffsetDateTime) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name_for(instance_id));
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(i64::from(self.config.validity_days));
        params
    }
}

fn subject_alt_name(hostname: &str) -> Result<SanType> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name: Ia5String = hostname
        .try_into()
        .map_err(|_| DraupnirError::Config(format!("invalid public hostname {hostname:?}")))?;
    Ok(SanType::DnsName(name))
}

/// Positive 128-bit serial from a random UUID
fn random_serial() -> [u8; 16] {
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    bytes
}

/// Current time at second precision, in both chrono and `time` form
fn now_to_second() -> Result<(DateTime<Utc>, OffsetDateTime)> {
    let seconds = Utc::now().timestamp();
    let chrono_now = DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| DraupnirError::Internal("clock out of range".into()))?;
    let time_now = OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| DraupnirError::Internal(format!("clock out of range: {e}")))?;
    Ok((chrono_now, time_now))
}

pub fn fingerprint(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

async fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn internal(err: rcgen::Error) -> DraupnirError {
    DraupnirError::Internal(format!("certificate generation failed: {err}"))
}

fn corrupted(what: &str, err: rcgen::Error) -> DraupnirError {
    DraupnirError::Corrupted(format!("unreadable {what}: {err}"))
}
