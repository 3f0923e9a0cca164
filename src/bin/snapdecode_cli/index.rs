//! ID registry command - dump or query a global `struct idr`

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use snapdecode_core::{IdIndex, IndexMode};
use snapdecode_types::encoding::format_address;
use snapdecode_types::Address;

use super::output::emit;
use super::Session;

#[derive(Parser, Debug)]
pub struct IdrCmd {
    /// Symbol of the registry (e.g. "worker_pool_idr")
    pub symbol: String,

    /// Look up a single id instead of listing every entry
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct IdrEntry {
    id: u64,
    address: Address,
}

#[derive(Debug, Serialize)]
struct IdrDump {
    symbol: String,
    mode: IndexMode,
    max_id: u64,
    entries: Vec<IdrEntry>,
}

#[derive(Debug, Serialize)]
struct IdrLookup {
    symbol: String,
    id: i64,
    address: Option<Address>,
}

fn render_dump(dump: &IdrDump) -> String {
    let mut out = format!(
        "{} ({:?} encoding, max id {})\n",
        dump.symbol, dump.mode, dump.max_id
    );
    if dump.entries.is_empty() {
        out.push_str("  (empty)\n");
    }
    for entry in &dump.entries {
        out.push_str(&format!("  {:>6}: {}\n", entry.id, format_address(entry.address)));
    }
    out
}

fn render_lookup(lookup: &IdrLookup) -> String {
    match lookup.address {
        Some(address) => format!("{}[{}]: {}\n", lookup.symbol, lookup.id, format_address(address)),
        None => format!("{}[{}]: not present\n", lookup.symbol, lookup.id),
    }
}

impl IdrCmd {
    pub fn execute(&self, session: &Session, json_output: bool) -> Result<()> {
        let index = IdIndex::from_symbol(session.target(), &self.symbol)
            .with_context(|| format!("failed to open registry '{}'", self.symbol))?;
        index
            .validate()
            .with_context(|| format!("registry '{}' is malformed", self.symbol))?;

        if let Some(id) = self.id {
            let lookup = IdrLookup {
                symbol: self.symbol.clone(),
                id,
                address: index.lookup(id)?,
            };
            return emit(&lookup, json_output, render_lookup);
        }

        let entries = index
            .iter()
            .map(|entry| entry.map(|(id, address)| IdrEntry { id, address }))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to walk registry '{}'", self.symbol))?;
        let dump = IdrDump {
            symbol: self.symbol.clone(),
            mode: index.mode(),
            max_id: index.max_id(),
            entries,
        };
        emit(&dump, json_output, render_dump)
    }
}
