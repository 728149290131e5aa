// # Command-Line Client
//
// One-shot commands against a running API: add, delete, associate, switch,
// search. Document text comes from a file argument or stdin.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::document::DocumentId;
use crate::error::{MatchError, Result};
use crate::registry::Flags;

pub async fn run(flags: &Flags, args: &[String]) -> Result<()> {
    let command = args
        .first()
        .ok_or_else(|| MatchError::Invalid("missing client command".to_string()))?;
    let base = format!("http://{}", flags.api_address);
    let http = reqwest::Client::new();

    match command.as_str() {
        "add" => {
            let id = parse_id(args, 1)?;
            let text = read_text(args.get(3))?;
            let title = args.get(4).cloned().unwrap_or_default();
            #[derive(Serialize)]
            struct Body {
                title: String,
                text: String,
                metadata: BTreeMap<String, String>,
            }
            let url = format!("{}/document/{}/{}", base, id.doctype, id.docid);
            let body = Body {
                title,
                text,
                metadata: BTreeMap::new(),
            };
            print_response(http.post(&url).json(&body).send().await).await
        }
        "delete" => {
            let id = parse_id(args, 1)?;
            let url = format!("{}/document/{}/{}", base, id.doctype, id.docid);
            print_response(http.delete(&url).send().await).await
        }
        "associate" => {
            let id = parse_id(args, 1)?;
            let url = format!("{}/associate/{}/{}", base, id.doctype, id.docid);
            print_response(http.post(&url).send().await).await
        }
        "switch" => {
            let source = parse_id(args, 1)?;
            let target = parse_id(args, 3)?;
            let url = format!("{}/switch", base);
            let body = serde_json::json!({ "source": source, "target": target });
            print_response(http.post(&url).json(&body).send().await).await
        }
        "search" => {
            let text = read_text(args.get(1))?;
            let url = format!("{}/search", base);
            let body = serde_json::json!({ "text": text });
            print_response(http.post(&url).json(&body).send().await).await
        }
        other => Err(MatchError::Invalid(format!(
            "unknown client command {:?}",
            other
        ))),
    }
}

fn parse_id(args: &[String], at: usize) -> Result<DocumentId> {
    let doctype = parse_u32(args, at, "doctype")?;
    let docid = parse_u32(args, at + 1, "docid")?;
    Ok(DocumentId::new(doctype, docid))
}

fn parse_u32(args: &[String], at: usize, name: &str) -> Result<u32> {
    args.get(at)
        .ok_or_else(|| MatchError::Invalid(format!("missing {} argument", name)))?
        .parse()
        .map_err(|_| MatchError::Invalid(format!("{} must be a u32", name)))
}

// "-" or no argument reads stdin.
fn read_text(path: Option<&String>) -> Result<String> {
    match path.map(String::as_str) {
        Some("-") | None => {
            std::io::read_to_string(std::io::stdin()).map_err(MatchError::from)
        }
        Some(path) => std::fs::read_to_string(path).map_err(MatchError::from),
    }
}

async fn print_response(
    response: std::result::Result<reqwest::Response, reqwest::Error>,
) -> Result<()> {
    let response = response.map_err(|e| MatchError::Network(e.to_string()))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| MatchError::Network(e.to_string()))?;
    match serde_json::from_str::<Value>(&body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", body),
    }
    if status.is_success() {
        Ok(())
    } else {
        Err(MatchError::Internal(format!("api returned {}", status)))
    }
}
