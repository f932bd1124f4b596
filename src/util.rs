use std::ffi::OsStr;

use crate::error::HerdError;

/// Parse a memory amount into mebibytes.
///
/// A bare number is taken as MB (`"2048"`). Suffixed values use binary
/// units: `"2G"` = 2048, `"512M"` = 512, `"1T"` = 1048576.
pub fn parse_memory_mb(s: &str) -> Result<u64, HerdError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(HerdError::Validation {
            message: "memory cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.trim().parse().map_err(|_| HerdError::Validation {
        message: format!("invalid memory amount: '{s}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "M" | "MB" | "MIB" => 1,
        "G" | "GB" | "GIB" => 1024,
        "T" | "TB" | "TIB" => 1024 * 1024,
        _ => {
            return Err(HerdError::Validation {
                message: format!("unknown memory suffix: '{suffix}' (use M, G or T)"),
            });
        }
    };

    let mb = num.checked_mul(multiplier).ok_or_else(|| HerdError::Validation {
        message: format!("memory overflows: '{s}'"),
    })?;
    if mb == 0 {
        return Err(HerdError::Validation {
            message: "memory must be greater than 0".into(),
        });
    }
    // libvirt takes KiB.
    if mb.checked_mul(1024).is_none() {
        return Err(HerdError::Validation {
            message: format!("memory too large: '{s}'"),
        });
    }
    Ok(mb)
}

/// Run an external tool to completion, returning its stdout.
///
/// A non-zero exit becomes `ExternalCommand` carrying the tool's stderr.
pub async fn run_command<I, S>(program: &str, args: I) -> Result<String, HerdError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    tracing::debug!(program, args = ?args, "running external command");

    let output = tokio::process::Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| HerdError::Io {
            context: format!("running {program}"),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HerdError::ExternalCommand {
            command: program.into(),
            message: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
