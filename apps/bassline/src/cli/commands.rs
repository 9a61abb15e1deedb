//! # CLI Command Implementations

use bassline::api;
use bassline::bridge::{LocalBridge, RemoteBridge};
use bassline::config::CONFIG_FILE_NAME;
use bassline::{AppConfig, AppError};
use bassline_core::limits::MAX_TEMPLATE_BYTES;
use bassline_core::{
    BridgeKind, CommandRequest, CommandResponse, ExternalInput, GroupId, GroupTemplate,
    ImportResult, PrimitiveInfo, decode_template, encode_template,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

// =============================================================================
// FILE LIMITS
// =============================================================================

/// Maximum size of a command file for `exec` (10 MB).
const MAX_COMMAND_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), AppError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| AppError::Io(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(AppError::Io(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve an input path: canonical, existing, a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, AppError> {
    let canonical = path.canonicalize().map_err(|e| {
        AppError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(AppError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path: its parent directory must exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        AppError::Io(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(AppError::Io(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| AppError::Io("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

fn read_validated(path: &Path, max_size: u64) -> Result<Vec<u8>, AppError> {
    let path = validate_file_path(path)?;
    validate_file_size(&path, max_size)?;
    std::fs::read(&path).map_err(|e| AppError::Io(format!("Read file: {}", e)))
}

fn print_json<T: serde::Serialize>(value: &T, json_mode: bool) {
    let text = if json_mode {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    println!("{}", text.unwrap_or_default());
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Serve the configured kernel to remote bridges.
pub async fn cmd_server(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), AppError> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let kernel = config.build_kernel()?;
    let addr = config.server.addr();

    println!("Bassline Peer Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Address:   {}", addr);
    println!("  Storage:   {:?}", config.storage.backend);
    println!("  Database:  {:?}", config.storage.path);
    println!("  Scheduler: {}", config.kernel.scheduler);
    println!();
    println!("Endpoints:");
    println!("  POST   /command                    - Execute a command envelope");
    println!("  POST   /subscriptions              - Subscribe to a group's changes");
    println!("  GET    /subscriptions/{{id}}/changes - Poll queued changes");
    println!("  DELETE /subscriptions/{{id}}         - Unsubscribe");
    println!("  GET    /groups/{{id}}/export         - Export a group template");
    println!("  GET    /status                     - Kernel status");
    println!("  GET    /health                     - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(&addr, kernel).await
}

// =============================================================================
// EXEC COMMAND
// =============================================================================

/// Parse `text` as one envelope or an array of envelopes.
fn parse_envelopes(text: &[u8]) -> Result<Vec<Value>, AppError> {
    let value: Value = serde_json::from_slice(text)
        .map_err(|e| AppError::Config(format!("Invalid command JSON: {}", e)))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

/// Execute command envelopes in order and print every response.
pub async fn cmd_exec(
    config: &AppConfig,
    json_mode: bool,
    command: Option<String>,
    file: Option<PathBuf>,
    remote: Option<String>,
) -> Result<(), AppError> {
    let text = match (command, file) {
        (Some(inline), None) => inline.into_bytes(),
        (None, Some(path)) => read_validated(&path, MAX_COMMAND_FILE_SIZE)?,
        _ => {
            return Err(AppError::Config(
                "exec needs inline JSON or --file".to_string(),
            ));
        }
    };
    let envelopes = parse_envelopes(&text)?;

    let responses = match remote {
        Some(url) => exec_remote(&url, envelopes).await?,
        None => exec_local(config, envelopes).await?,
    };

    let failed = responses.iter().filter(|r| r.error.is_some()).count();
    for response in &responses {
        print_json(response, json_mode);
    }
    if failed > 0 {
        tracing::warn!(failed, total = responses.len(), "some commands failed");
    }
    Ok(())
}

async fn exec_local(
    config: &AppConfig,
    envelopes: Vec<Value>,
) -> Result<Vec<CommandResponse>, AppError> {
    let bridge = LocalBridge::spawn(config.build_kernel()?)?;
    let mut responses = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let response = match CommandRequest::from_json(envelope) {
            Ok(request) => bridge.execute(request).await?,
            Err(rejected) => CommandResponse::failure(rejected.request_id, &rejected.error),
        };
        responses.push(response);
    }

    // Apply whatever a batching scheduler still holds before exiting.
    let mut kernel = bridge.shutdown().await?;
    let applied = kernel.tick()?;
    if applied > 0 {
        tracing::debug!(applied, "flushed pending updates");
    }
    Ok(responses)
}

async fn exec_remote(url: &str, envelopes: Vec<Value>) -> Result<Vec<CommandResponse>, AppError> {
    let mut bridge = RemoteBridge::new(url);
    if let Some(key) = api::get_api_key_from_env() {
        bridge = bridge.with_api_key(key);
    }
    let mut responses = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let response = match CommandRequest::from_json(envelope) {
            // Refused here, nothing is sent.
            Ok(request) => match BridgeKind::Remote.check(&request.input) {
                Ok(()) => bridge.execute(&request).await?,
                Err(e) => CommandResponse::failure(request.request_id, &e),
            },
            Err(rejected) => CommandResponse::failure(rejected.request_id, &rejected.error),
        };
        responses.push(response);
    }
    Ok(responses)
}

// =============================================================================
// EXPORT / IMPORT COMMANDS
// =============================================================================

/// Export a group subtree as a JSON or binary template.
pub fn cmd_export(
    config: &AppConfig,
    group: u64,
    output: &Path,
    format: &str,
) -> Result<(), AppError> {
    let output = validate_output_path(output)?;
    let mut kernel = config.build_kernel()?;
    let value = kernel.dispatch(ExternalInput::ExportGroup {
        group_id: GroupId(group),
    })?;
    let template: GroupTemplate = serde_json::from_value(value)
        .map_err(|e| AppError::Io(format!("Decode template: {}", e)))?;

    let data = match format {
        "json" => serde_json::to_vec_pretty(&template)
            .map_err(|e| AppError::Io(format!("Encode template: {}", e)))?,
        "binary" => encode_template(&template)?,
        _ => {
            return Err(AppError::Config(format!(
                "Unknown format: {} (expected json or binary)",
                format
            )));
        }
    };
    std::fs::write(&output, &data).map_err(|e| AppError::Io(format!("Write file: {}", e)))?;

    println!(
        "Exported group {} ({} contacts, {} bytes) to {:?}",
        group,
        template.contact_count(),
        data.len(),
        output
    );
    Ok(())
}

/// Decode a template file: JSON when it starts with an object, the framed
/// binary form otherwise.
fn read_template(input: &Path) -> Result<GroupTemplate, AppError> {
    let data = read_validated(input, MAX_TEMPLATE_BYTES as u64)?;
    let is_json = data
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if is_json {
        serde_json::from_slice(&data)
            .map_err(|e| AppError::Config(format!("Invalid template JSON: {}", e)))
    } else {
        Ok(decode_template(&data)?)
    }
}

/// Instantiate a template file into the configured kernel.
pub fn cmd_import(
    config: &AppConfig,
    json_mode: bool,
    input: &Path,
    parent: Option<u64>,
) -> Result<(), AppError> {
    let template = read_template(input)?;
    let mut kernel = config.build_kernel()?;
    let value = kernel.dispatch(ExternalInput::ImportTemplate {
        template,
        parent_group_id: parent.map(GroupId),
    })?;
    let result: ImportResult = serde_json::from_value(value)
        .map_err(|e| AppError::Io(format!("Decode import result: {}", e)))?;

    if json_mode {
        print_json(&result, true);
        return Ok(());
    }

    println!("Imported as group {}", result.group_id);
    for skipped in &result.skipped_wires {
        println!("  skipped wire: {:?}", skipped);
    }
    Ok(())
}

// =============================================================================
// PRIMITIVES & STATUS COMMANDS
// =============================================================================

/// List primitive gadgets with their ports.
pub fn cmd_primitives(config: &AppConfig, json_mode: bool) -> Result<(), AppError> {
    let mut kernel = config.build_kernel()?;
    let value = kernel.dispatch(ExternalInput::ListPrimitiveInfo)?;
    let infos: Vec<PrimitiveInfo> = serde_json::from_value(value)
        .map_err(|e| AppError::Io(format!("Decode primitives: {}", e)))?;

    if json_mode {
        print_json(&infos, true);
        return Ok(());
    }

    println!("Primitive Gadgets");
    println!("=================");
    for info in &infos {
        println!(
            "  {:<20} ({}) -> ({})  {}",
            info.qualified_name,
            info.inputs.join(", "),
            info.outputs.join(", "),
            info.description
        );
    }
    Ok(())
}

/// Show kernel status.
pub fn cmd_status(config: &AppConfig, json_mode: bool) -> Result<(), AppError> {
    let kernel = config.build_kernel()?;
    let status = kernel.status();

    if json_mode {
        print_json(&status, true);
        return Ok(());
    }

    println!("Bassline Kernel Status");
    println!("======================");
    println!("Storage:   {:?}", config.storage.backend);
    println!("Database:  {:?}", config.storage.path);
    println!("Drivers:   {}", status.drivers.join(", "));
    println!("Scheduler: {}", status.scheduler);
    println!();
    println!("Root groups:    {}", status.roots);
    println!("Groups:         {}", status.counts.groups);
    println!("Contacts:       {}", status.counts.contacts);
    println!("Wires:          {}", status.counts.wires);
    println!("Pending:        {}", status.pending_updates);
    println!("Contradictions: {}", status.contradictions);

    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write the default configuration file.
pub fn cmd_init(path: Option<&Path>, force: bool) -> Result<(), AppError> {
    let path = path.unwrap_or(Path::new(CONFIG_FILE_NAME));
    if path.exists() && !force {
        return Err(AppError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let path = validate_output_path(path)?;
    std::fs::write(&path, AppConfig::default_toml())
        .map_err(|e| AppError::Io(format!("Write config: {}", e)))?;
    println!("Wrote {}", path.display());
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
