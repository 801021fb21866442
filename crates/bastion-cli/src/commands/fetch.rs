//! `bastion fetch` command.
//!
//! Sends one HTTP request through the network policy and prints the body.

use std::io::Write;
use std::process::ExitCode;

use clap::{Args, ValueEnum};

use bastion_access::HttpMethod;
use bastion_runtime::{NetOp, NetOpOutput, SafetyManager};

use crate::{output, shared};

/// HTTP method accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl From<Method> for HttpMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => HttpMethod::Get,
            Method::Post => HttpMethod::Post,
            Method::Put => HttpMethod::Put,
            Method::Delete => HttpMethod::Delete,
        }
    }
}

/// Fetch a URL through the network policy.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Absolute http(s) URL.
    pub url: String,
    /// HTTP method.
    #[arg(short = 'X', long, value_enum, default_value = "get")]
    pub method: Method,
    /// Request header as "Name: value" (repeatable).
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,
    /// Request body.
    #[arg(short, long)]
    pub data: Option<String>,
    /// Print status line and response headers before the body.
    #[arg(short, long)]
    pub include: bool,
}

/// Splits "Name: value" header arguments.
///
/// # Errors
///
/// Returns an error for an argument without a colon.
pub fn parse_headers(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|h| {
            h.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| anyhow::anyhow!("header must be \"Name: value\", got {h:?}"))
        })
        .collect()
}

/// Executes the fetch command. Exits non-zero for a non-2xx status.
pub async fn execute(args: &FetchArgs, manager: &SafetyManager) -> anyhow::Result<ExitCode> {
    let headers = parse_headers(&args.headers)?;
    let output = manager
        .net_op(NetOp::Request {
            method: args.method.into(),
            url: args.url.clone(),
            headers,
            body: args.data.as_ref().map(|d| d.as_bytes().to_vec()),
        })
        .await
        .map_err(|e| shared::diagnose(e, "fetch failed"))?;
    let NetOpOutput::Response(response) = output else {
        return Ok(ExitCode::FAILURE);
    };

    if args.include {
        println!("HTTP {} {}", response.status_code, response.url);
        for (name, value) in &response.headers {
            println!("{name}: {value}");
        }
        println!();
    }
    std::io::stdout().write_all(&response.body)?;

    if (200..300).contains(&response.status_code) {
        Ok(ExitCode::SUCCESS)
    } else {
        output::print_error(&format!("server answered {}", response.status_code));
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_split_and_trimmed() {
        let parsed = parse_headers(&["Accept: application/json".into(), "X-A:b".into()])
            .expect("headers");
        assert_eq!(
            parsed,
            vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("X-A".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn header_without_colon_is_rejected() {
        assert!(parse_headers(&["nonsense".into()]).is_err());
    }

    #[tokio::test]
    async fn private_address_is_refused() {
        let manager = shared::create_manager(&bastion_config::BastionConfig::default())
            .expect("manager");
        let args = FetchArgs {
            url: "http://127.0.0.1/".into(),
            method: Method::Get,
            headers: Vec::new(),
            data: None,
            include: false,
        };
        assert!(execute(&args, &manager).await.is_err());
    }
}
