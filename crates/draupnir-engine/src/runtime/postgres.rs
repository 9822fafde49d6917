use super::{DatabaseRuntime, InstanceSpec};
use crate::ca::{common_name_for, ServerTls};
use crate::process::run;
use anyhow::{Context, Result};
use async_trait::async_trait;
use draupnir_common::{ImageId, InstanceId};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command as AsyncCommand;
use tracing::{info, instrument, warn};

const SERVER_CERT: &str = "server.crt";
const SERVER_KEY: &str = "server.key";
const ROOT_CERT: &str = "root.crt";
const IDENT_MAP: &str = "draupnir";
/// Socket-only port used while anonymising; never bound to TCP.
const MAINTENANCE_PORT: u16 = 5432;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Directory holding `pg_ctl` and `psql`
    pub bin_dir: PathBuf,
    /// Run the tools as the `postgres` user through `sudo -n`
    pub use_sudo: bool,
    pub start_timeout_secs: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("/usr/lib/postgresql/bin"),
            use_sudo: false,
            start_timeout_secs: 60,
        }
    }
}

/// Drives PostgreSQL through `pg_ctl`, one postmaster per data directory.
pub struct PostgresRuntime {
    config: PostgresConfig,
}

impl PostgresRuntime {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    /// Whether `pg_ctl` is present in the configured bin directory
    pub async fn is_available(&self) -> bool {
        fs::try_exists(self.config.bin_dir.join("pg_ctl"))
            .await
            .unwrap_or(false)
    }

    fn tool(&self, name: &str) -> AsyncCommand {
        let path = self.config.bin_dir.join(name);
        if self.config.use_sudo {
            let mut cmd = AsyncCommand::new("sudo");
            cmd.args(["-n", "-u", "postgres"]).arg(path);
            cmd
        } else {
            AsyncCommand::new(path)
        }
    }

    async fn pg_ctl_start(&self, data_dir: &Path, options: String) -> Result<()> {
        let mut cmd = self.tool("pg_ctl");
        cmd.arg("-D")
            .arg(data_dir)
            .arg("-w")
            .arg("-t")
            .arg(self.config.start_timeout_secs.to_string())
            .arg("-l")
            .arg(data_dir.join("postgres.log"))
            .arg("-o")
            .arg(options)
            .arg("start");
        run(cmd, "pg_ctl start").await?;
        Ok(())
    }

    async fn pg_ctl_stop(&self, data_dir: &Path) -> Result<()> {
        if !fs::try_exists(data_dir.join("postmaster.pid")).await? {
            return Ok(());
        }
        let mut cmd = self.tool("pg_ctl");
        cmd.arg("-D")
            .arg(data_dir)
            .args(["-m", "fast", "-w", "stop"]);
        run(cmd, "pg_ctl stop").await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseRuntime for PostgresRuntime {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, script), fields(data_dir = %data_dir.display()))]
    async fn anonymise(&self, image_id: ImageId, data_dir: &Path, script: &str) -> Result<()> {
        prepare_data_dir(data_dir).await?;

        // The postgres user has to be able to read it when running under sudo.
        let mut script_file = tempfile::Builder::new()
            .prefix("draupnir-anon-")
            .suffix(".sql")
            .tempfile()?;
        script_file.write_all(script.as_bytes())?;
        script_file.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(script_file.path(), std::fs::Permissions::from_mode(0o644))?;
        }

        let options = format!(
            "-p {MAINTENANCE_PORT} -c listen_addresses='' -k {}",
            data_dir.display()
        );
        self.pg_ctl_start(data_dir, options).await?;

        let mut psql = self.tool("psql");
        psql.arg("-h")
            .arg(data_dir)
            .arg("-p")
            .arg(MAINTENANCE_PORT.to_string())
            .args(["-U", "postgres", "-d", "postgres", "-v", "ON_ERROR_STOP=1", "-f"])
            .arg(script_file.path());
        let outcome = run(psql, "anonymisation script").await;

        // Always shut down, even when the script failed.
        let stopped = self.pg_ctl_stop(data_dir).await;
        outcome?;
        stopped?;

        info!(image_id, "anonymised image");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(instance_id = spec.instance_id, port = spec.port))]
    async fn start(&self, spec: &InstanceSpec) -> Result<()> {
        prepare_data_dir(&spec.data_dir).await?;
        install_tls(&spec.data_dir, &spec.tls).await?;
        fs::write(spec.data_dir.join("pg_hba.conf"), render_hba()).await?;
        fs::write(
            spec.data_dir.join("pg_ident.conf"),
            render_ident(spec.instance_id),
        )
        .await?;

        self.pg_ctl_start(&spec.data_dir, start_options(spec)).await?;
        info!(image_id = spec.image_id, "started instance database");
        Ok(())
    }

    #[instrument(skip(self), fields(data_dir = %data_dir.display()))]
    async fn stop(&self, instance_id: InstanceId, data_dir: &Path) -> Result<()> {
        if !fs::try_exists(data_dir).await? {
            warn!("data directory already gone; nothing to stop");
            return Ok(());
        }
        self.pg_ctl_stop(data_dir).await?;
        info!("stopped instance database");
        Ok(())
    }
}

/// Clear leftovers from the source host and tighten permissions so the
/// postmaster agrees to start.
async fn prepare_data_dir(data_dir: &Path) -> Result<()> {
    for stale in ["postmaster.pid", "postmaster.opts"] {
        match fs::remove_file(data_dir.join(stale)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {stale}")),
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn install_tls(data_dir: &Path, tls: &ServerTls) -> Result<()> {
    fs::write(data_dir.join(SERVER_CERT), &tls.certificate).await?;
    fs::write(data_dir.join(ROOT_CERT), &tls.ca_certificate).await?;
    let key_path = data_dir.join(SERVER_KEY);
    fs::write(&key_path, &tls.private_key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn render_hba() -> String {
    format!(
        "# Managed by draupnir\n\
         local all postgres peer\n\
         hostssl all all 0.0.0.0/0 cert map={IDENT_MAP}\n\
         hostssl all all ::/0 cert map={IDENT_MAP}\n"
    )
}

fn render_ident(instance_id: InstanceId) -> String {
    format!(
        "# Managed by draupnir\n{IDENT_MAP} {} postgres\n",
        common_name_for(instance_id)
    )
}

fn start_options(spec: &InstanceSpec) -> String {
    format!(
        "-p {} -c listen_addresses='*' -k {} -c ssl=on -c ssl_cert_file={SERVER_CERT} \
         -c ssl_key_file={SERVER_KEY} -c ssl_ca_file={ROOT_CERT}",
        spec.port,
        spec.data_dir.display()
    )
}
