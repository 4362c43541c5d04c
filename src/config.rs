use clap::Parser;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_COMMAND_METADATA_FILE: &str = "metadata/command_metadata.json";

/// Spelling used when encoding result values in text format.
///
/// POSTGRESQL is the default and what PostgreSQL clients that interpret
/// returned data (JDBC, ORMs) expect. SPANNER returns data in the backend's
/// own spelling, which only makes sense for text-only clients such as psql
/// that display values without parsing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum TextFormat {
    Postgresql,
    Spanner,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pgbridge")]
#[command(about = "PostgreSQL wire protocol proxy for non-PostgreSQL SQL backends", long_about = None)]
#[command(infer_long_args = true)]
pub struct Config {
    #[arg(
        short = 's',
        long = "server-port",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..),
        env = "PGBRIDGE_PORT",
        help = "This proxy's port number"
    )]
    pub server_port: u16,

    #[arg(short, long, env = "PGBRIDGE_PROJECT", help = "The id of the project wherein lives the backend database")]
    pub project: Option<String>,

    #[arg(short, long, env = "PGBRIDGE_INSTANCE", help = "The id of the backend instance within the project")]
    pub instance: Option<String>,

    #[arg(short, long, env = "PGBRIDGE_DATABASE", help = "The name of the backend database")]
    pub database: Option<String>,

    #[arg(
        short,
        long = "credentials-file",
        env = "PGBRIDGE_CREDENTIALS_FILE",
        help = "Full path of the backend credentials file. When not specified, the ambient default credentials are used"
    )]
    pub credentials_file: Option<String>,

    #[arg(
        short = 'f',
        long = "format",
        value_enum,
        ignore_case = true,
        default_value = "POSTGRESQL",
        env = "PGBRIDGE_TEXT_FORMAT",
        help = "Text format used for result values"
    )]
    pub text_format: TextFormat,

    #[arg(
        short = 'b',
        long = "force-binary-format",
        env = "PGBRIDGE_FORCE_BINARY",
        help = "Return extended-query results in binary format when the client requested no specific format. \
                Simple-query results are always text regardless"
    )]
    pub force_binary: bool,

    #[arg(
        short,
        long,
        env = "PGBRIDGE_AUTHENTICATE",
        help = "Require a cleartext password during connection startup"
    )]
    pub authenticate: bool,

    #[arg(
        short = 'q',
        long = "psql-mode",
        env = "PGBRIDGE_PSQL_MODE",
        help = "Enable psql meta-command matching. Adds a per-statement matching cost; not meant for production"
    )]
    pub psql_mode: bool,

    #[arg(
        short = 'j',
        long = "options-metadata",
        env = "PGBRIDGE_COMMAND_METADATA_FILE",
        help = "Path of the JSON file describing the psql-mode meta-command matchers"
    )]
    pub command_metadata_file: Option<String>,

    #[arg(
        short = 'r',
        long = "query-rewrites-metadata",
        env = "PGBRIDGE_QUERY_REWRITES_FILE",
        help = "Path of the JSON file containing query rewrite instructions"
    )]
    pub query_rewrites_file: Option<String>,

    #[arg(short = 'x', long = "bigquery", env = "PGBRIDGE_BIGQUERY", help = "BigQuery connection mode")]
    pub bigquery_mode: bool,

    #[arg(
        long,
        env = "PGBRIDGE_EMBEDDED",
        help = "Run against the embedded SQLite driver (path or :memory:), mainly for local development and tests"
    )]
    pub embedded_database: Option<String>,

    #[arg(long, default_value = "info", env = "PGBRIDGE_LOG_LEVEL", help = "Tracing filter directive")]
    pub log_level: String,
}

impl Config {
    pub fn load() -> Self {
        Config::parse()
    }

    /// Cross-option checks that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.command_metadata_file.is_some() && !self.psql_mode {
            return Err(
                "psql mode must be toggled (-q) to specify a command metadata file (-j)"
                    .to_string(),
            );
        }
        if self.embedded_database.is_none() {
            for (name, value) in [
                ("project", &self.project),
                ("database", &self.database),
            ] {
                if value.is_none() {
                    return Err(format!("missing required backend option --{name}"));
                }
            }
            if !self.bigquery_mode && self.instance.is_none() {
                return Err("missing required backend option --instance".to_string());
            }
        }
        Ok(())
    }

    /// Build the backend connection URL. Formats match the upstream
    /// JDBC-style URLs so external drivers can mount under the same scheme.
    pub fn connection_url(&self) -> String {
        if let Some(ref path) = self.embedded_database {
            return format!("sqlite:{path}");
        }
        let blank = String::new();
        let project = self.project.as_ref().unwrap_or(&blank);
        let database = self.database.as_ref().unwrap_or(&blank);
        if self.bigquery_mode {
            format!(
                "bigquery://https://www.googleapis.com/bigquery/v2:443;ProjectId={project};DefaultDataset={database};OAuthType=3"
            )
        } else {
            let instance = self.instance.as_ref().unwrap_or(&blank);
            let credentials = self
                .credentials_file
                .clone()
                .or_else(crate::auth::ambient_credentials_path)
                .unwrap_or_default();
            format!(
                "cloudspanner:/projects/{project}/instances/{instance}/databases/{database};credentials={credentials}"
            )
        }
    }

    pub fn command_metadata_path(&self) -> &str {
        self.command_metadata_file
            .as_deref()
            .unwrap_or(DEFAULT_COMMAND_METADATA_FILE)
    }

    /// A configuration for tests: embedded backend, ephemeral settings.
    pub fn for_embedded(database: &str) -> Self {
        Config {
            server_port: DEFAULT_PORT,
            project: None,
            instance: None,
            database: None,
            credentials_file: None,
            text_format: TextFormat::Postgresql,
            force_binary: false,
            authenticate: false,
            psql_mode: false,
            command_metadata_file: None,
            query_rewrites_file: None,
            bigquery_mode: false,
            embedded_database: Some(database.to_string()),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bounds_enforced_by_parser() {
        assert!(Config::try_parse_from(["pgbridge", "--embedded", ":memory:", "-s", "0"]).is_err());
        assert!(
            Config::try_parse_from(["pgbridge", "--embedded", ":memory:", "-s", "65536"]).is_err()
        );
        let config =
            Config::try_parse_from(["pgbridge", "--embedded", ":memory:", "-s", "65535"]).unwrap();
        assert_eq!(config.server_port, 65535);
        let config = Config::try_parse_from(["pgbridge", "--embedded", ":memory:", "-s", "1"]).unwrap();
        assert_eq!(config.server_port, 1);
    }

    #[test]
    fn metadata_file_requires_psql_mode() {
        let config = Config::try_parse_from([
            "pgbridge",
            "--embedded",
            ":memory:",
            "-j",
            "commands.json",
        ])
        .unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from([
            "pgbridge",
            "--embedded",
            ":memory:",
            "-q",
            "-j",
            "commands.json",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backend_options_required_without_embedded() {
        let config = Config::try_parse_from(["pgbridge"]).unwrap();
        assert!(config.validate().is_err());
        let config = Config::try_parse_from([
            "pgbridge", "-p", "proj", "-i", "inst", "-d", "db",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn spanner_connection_url() {
        let config = Config::try_parse_from([
            "pgbridge", "-p", "proj", "-i", "inst", "-d", "db", "-c", "/tmp/creds.json",
        ])
        .unwrap();
        assert_eq!(
            config.connection_url(),
            "cloudspanner:/projects/proj/instances/inst/databases/db;credentials=/tmp/creds.json"
        );
    }

    #[test]
    fn bigquery_connection_url() {
        let config =
            Config::try_parse_from(["pgbridge", "-p", "proj", "-d", "db", "-x"]).unwrap();
        assert!(config.validate().is_ok());
        let url = config.connection_url();
        assert!(url.starts_with("bigquery://"));
        assert!(url.contains("ProjectId=proj"));
        assert!(url.contains("DefaultDataset=db"));
    }

    #[test]
    fn embedded_connection_url() {
        let config = Config::for_embedded(":memory:");
        assert_eq!(config.connection_url(), "sqlite::memory:");
    }
}
