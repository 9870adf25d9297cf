//! CRUD for `command_pair` / `command_singleton` rows (§3, §4.4, §4.6 item
//! 2). Mirrors [`super::comments`]'s replace-the-full-set shape: the
//! canonical pattern-seeded rows and any imported customs are merged by the
//! caller (orchestrator on add, the import pipeline on parse) before being
//! handed here, so a store write is always a plain overwrite.

use std::collections::BTreeMap;

use rusqlite::params;

use crate::error::MeshResult;
use crate::model::{CommandPair, CommandScope, CommandSingleton, EntityKind};
use crate::patterns::PatternName;

use super::Store;

fn join_lines(items: &[String]) -> String {
    items.join("\n")
}

fn split_lines(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split('\n').map(ToString::to_string).collect()
    }
}

fn join_vars(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn split_vars(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn row_to_pair(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandPair> {
    let kind: String = row.get(2)?;
    let pattern: Option<String> = row.get(3)?;
    let scope: String = row.get(7)?;
    Ok(CommandPair {
        entity_guid: row.get(1)?,
        entity_kind: EntityKind::from_str(&kind).ok_or_else(|| bad_col(2))?,
        pattern_name: pattern.and_then(|p| PatternName::parse(&p)),
        up_commands: split_lines(&row.get::<_, String>(4)?),
        down_commands: split_lines(&row.get::<_, String>(5)?),
        variables: split_vars(&row.get::<_, String>(6)?),
        scope: CommandScope::parse(&scope).ok_or_else(|| bad_col(7))?,
        execution_order: row.get(8)?,
    })
}

fn row_to_singleton(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandSingleton> {
    let kind: String = row.get(2)?;
    let pattern: Option<String> = row.get(3)?;
    let scope: String = row.get(7)?;
    Ok(CommandSingleton {
        entity_guid: row.get(1)?,
        entity_kind: EntityKind::from_str(&kind).ok_or_else(|| bad_col(2))?,
        pattern_name: pattern.and_then(|p| PatternName::parse(&p)),
        direction_is_up: row.get::<_, i64>(4)? != 0,
        command: row.get(5)?,
        variables: split_vars(&row.get::<_, String>(6)?),
        scope: CommandScope::parse(&scope).ok_or_else(|| bad_col(7))?,
        execution_order: row.get(8)?,
    })
}

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

impl Store {
    pub fn list_command_pairs(&self, entity_guid: &str) -> MeshResult<Vec<CommandPair>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, entity_guid, entity_kind, pattern_name, up_commands, down_commands,
                        variables, scope, execution_order
                 FROM command_pair WHERE entity_guid = ?1 ORDER BY execution_order",
            )?;
            let rows = stmt
                .query_map(params![entity_guid], row_to_pair)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replaces the full `command_pair` set for one entity (canonical
    /// pattern-seeded rows plus any imported customs, already merged by the
    /// caller).
    pub fn replace_command_pairs(&self, entity_guid: &str, pairs: &[CommandPair]) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM command_pair WHERE entity_guid = ?1", params![entity_guid])?;
            for p in pairs {
                tx.execute(
                    "INSERT INTO command_pair
                     (entity_guid, entity_kind, pattern_name, up_commands, down_commands,
                      variables, scope, execution_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        entity_guid,
                        p.entity_kind.as_str(),
                        p.pattern_name.map(PatternName::as_str),
                        join_lines(&p.up_commands),
                        join_lines(&p.down_commands),
                        join_vars(&p.variables),
                        p.scope.as_str(),
                        p.execution_order,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn list_command_singletons(&self, entity_guid: &str) -> MeshResult<Vec<CommandSingleton>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, entity_guid, entity_kind, pattern_name, direction_is_up, command,
                        variables, scope, execution_order
                 FROM command_singleton WHERE entity_guid = ?1 ORDER BY execution_order",
            )?;
            let rows = stmt
                .query_map(params![entity_guid], row_to_singleton)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replaces the full `command_singleton` set for one entity: the
    /// unpaired (`custom` fallback) fragments §3 describes.
    pub fn replace_command_singletons(
        &self,
        entity_guid: &str,
        singletons: &[CommandSingleton],
    ) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM command_singleton WHERE entity_guid = ?1", params![entity_guid])?;
            for s in singletons {
                tx.execute(
                    "INSERT INTO command_singleton
                     (entity_guid, entity_kind, pattern_name, direction_is_up, command,
                      variables, scope, execution_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        entity_guid,
                        s.entity_kind.as_str(),
                        s.pattern_name.map(PatternName::as_str),
                        s.direction_is_up as i64,
                        s.command,
                        join_vars(&s.variables),
                        s.scope.as_str(),
                        s.execution_order,
                    ],
                )?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(order: i64) -> CommandPair {
        let mut vars = BTreeMap::new();
        vars.insert("cidr4".to_string(), "10.66.0.0/24".to_string());
        vars.insert("wan".to_string(), "eth0".to_string());
        CommandPair {
            entity_guid: "g1".to_string(),
            entity_kind: EntityKind::SubnetRouter,
            pattern_name: Some(PatternName::NatMasqueradeIpv4),
            up_commands: vec!["iptables -t nat -A POSTROUTING -s 10.66.0.0/24 -o eth0 -j MASQUERADE".to_string()],
            down_commands: vec!["iptables -t nat -D POSTROUTING -s 10.66.0.0/24 -o eth0 -j MASQUERADE".to_string()],
            variables: vars,
            scope: CommandScope::Interface,
            execution_order: order,
        }
    }

    #[test]
    fn replace_then_list_round_trips_pairs() {
        let store = Store::open_memory().unwrap();
        store.replace_command_pairs("g1", &[pair(0)]).unwrap();
        let listed = store.list_command_pairs("g1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pattern_name, Some(PatternName::NatMasqueradeIpv4));
        assert_eq!(listed[0].variables.get("wan"), Some(&"eth0".to_string()));
    }

    #[test]
    fn replace_then_list_round_trips_singletons() {
        let store = Store::open_memory().unwrap();
        let singleton = CommandSingleton {
            entity_guid: "g1".to_string(),
            entity_kind: EntityKind::SubnetRouter,
            pattern_name: None,
            direction_is_up: true,
            command: "echo custom-script.sh".to_string(),
            variables: BTreeMap::new(),
            scope: CommandScope::Global,
            execution_order: 7,
        };
        store.replace_command_singletons("g1", std::slice::from_ref(&singleton)).unwrap();
        let listed = store.list_command_singletons("g1").unwrap();
        assert_eq!(listed, vec![singleton]);
    }
}
