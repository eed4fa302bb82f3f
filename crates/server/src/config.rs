//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use lockstep_dispatch::{DispatchConfig, EngineConfig, Rank, LEADER_RANK};
use lockstep_protocol::{GenerationParams, ProtocolError};

/// Command line of the `lockstep-server` binary. Every flag falls back to an
/// environment variable so launchers that export `RANK` / `WORLD_SIZE` /
/// `MASTER_ADDR` work unchanged.
#[derive(Debug, Clone, Parser)]
#[command(name = "lockstep-server", version, about = "Tensor-parallel generation server")]
pub struct Args {
    /// Rank of this process (0 serves clients)
    #[arg(long, env = "RANK", default_value_t = 0)]
    pub rank: Rank,

    /// Number of processes in the group
    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    pub world_size: usize,

    /// Rendezvous address: the leader listens here, followers connect here
    #[arg(long, env = "MASTER_ADDR", default_value = "127.0.0.1:29500")]
    pub master_addr: String,

    /// Host the client API binds to
    #[arg(long, env = "LOCKSTEP_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port the client API binds to
    #[arg(long, env = "LOCKSTEP_PORT", default_value_t = 8042)]
    pub port: u16,

    /// Checkpoint directory handed to the engine
    #[arg(long, env = "LOCKSTEP_CKPT_DIR")]
    pub ckpt_dir: Option<PathBuf>,

    /// Tokenizer model handed to the engine
    #[arg(long, env = "LOCKSTEP_TOKENIZER_PATH")]
    pub tokenizer_path: Option<PathBuf>,

    #[arg(long, env = "LOCKSTEP_MAX_SEQ_LEN", default_value_t = 2048)]
    pub max_seq_len: usize,

    #[arg(long, env = "LOCKSTEP_MAX_BATCH_SIZE", default_value_t = 1)]
    pub max_batch_size: usize,

    /// Generation length used when a request does not name one
    #[arg(long, env = "LOCKSTEP_MAX_GEN_LEN", default_value_t = 2048)]
    pub default_max_gen_len: u32,

    #[arg(long, env = "LOCKSTEP_TEMPERATURE", default_value_t = 0.7)]
    pub default_temperature: f32,

    #[arg(long, env = "LOCKSTEP_TOP_P", default_value_t = 1.0)]
    pub default_top_p: f32,

    /// Tokens a WebSocket client may leave unacknowledged
    #[arg(long, env = "LOCKSTEP_MAX_UNACKED", default_value_t = 10)]
    pub max_unacked: u64,

    /// Seconds a WebSocket client may go without acknowledging before it is cut off
    #[arg(long, env = "LOCKSTEP_ACK_TIMEOUT_SECS", default_value_t = 10)]
    pub ack_timeout_secs: u64,

    #[arg(long, env = "LOCKSTEP_BROADCAST_TIMEOUT_SECS", default_value_t = 30)]
    pub broadcast_timeout_secs: u64,

    #[arg(long, env = "LOCKSTEP_REPORT_TIMEOUT_SECS", default_value_t = 60)]
    pub report_timeout_secs: u64,

    #[arg(long, env = "LOCKSTEP_QUEUE_TIMEOUT_SECS", default_value_t = 120)]
    pub queue_timeout_secs: u64,

    /// How long the group may take to assemble at startup
    #[arg(long, env = "LOCKSTEP_JOIN_TIMEOUT_SECS", default_value_t = 300)]
    pub join_timeout_secs: u64,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Rank of this process
    pub rank: Rank,
    /// Number of processes in the group
    pub world_size: usize,
    /// Rendezvous address of the process group
    pub master_addr: String,
    /// Host to bind the client API to
    pub host: String,
    /// Port to bind the client API to
    pub port: u16,
    /// Settings passed through to the engine
    pub engine: EngineConfig,
    /// Default maximum generation length per request
    pub default_max_gen_len: u32,
    /// Default temperature for sampling
    pub default_temperature: f32,
    /// Default nucleus sampling threshold
    pub default_top_p: f32,
    /// Maximum unacknowledged tokens per WebSocket connection
    pub max_unacked: u64,
    /// Time a WebSocket client may hold back its next acknowledgement
    pub ack_timeout: Duration,
    /// Round timeouts and buffer sizes
    pub dispatch: DispatchConfig,
    /// Time allowed for the process group to assemble
    pub join_timeout: Duration,
}

impl ServerConfig {
    /// Parse the process command line and environment
    pub fn from_args() -> Self {
        Args::parse().into()
    }

    /// Get the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_leader(&self) -> bool {
        self.rank == LEADER_RANK
    }

    /// Parameters a request without overrides would run with
    pub fn default_params(&self, prompt: impl Into<String>) -> GenerationParams {
        GenerationParams::new(
            prompt,
            self.default_max_gen_len,
            self.default_temperature,
            self.default_top_p,
        )
    }

    /// Check the generation defaults; with bad defaults every plain request
    /// would be refused
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.default_params("").validate()
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            rank: args.rank,
            world_size: args.world_size,
            master_addr: args.master_addr,
            host: args.host,
            port: args.port,
            engine: EngineConfig {
                ckpt_dir: args.ckpt_dir,
                tokenizer_path: args.tokenizer_path,
                max_seq_len: args.max_seq_len,
                max_batch_size: args.max_batch_size,
            },
            default_max_gen_len: args.default_max_gen_len,
            default_temperature: args.default_temperature,
            default_top_p: args.default_top_p,
            max_unacked: args.max_unacked,
            ack_timeout: Duration::from_secs(args.ack_timeout_secs),
            dispatch: DispatchConfig {
                broadcast_timeout: Duration::from_secs(args.broadcast_timeout_secs),
                report_timeout: Duration::from_secs(args.report_timeout_secs),
                queue_timeout: Duration::from_secs(args.queue_timeout_secs),
                ..DispatchConfig::default()
            },
            join_timeout: Duration::from_secs(args.join_timeout_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rank: LEADER_RANK,
            world_size: 1,
            master_addr: "127.0.0.1:29500".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8042,
            engine: EngineConfig::default(),
            default_max_gen_len: 2048,
            default_temperature: 0.7,
            default_top_p: 1.0,
            max_unacked: 10,
            ack_timeout: Duration::from_secs(10),
            dispatch: DispatchConfig::default(),
            join_timeout: Duration::from_secs(300),
        }
    }
}
