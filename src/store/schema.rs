//! Schema DDL for the semantic store (§3). One table per entity kind
//! sharing the common identity shape, plus the supporting tables.
//! `PRAGMA foreign_keys=ON` (set by [`super::Store::open`]) gets cascade
//! deletes from SQLite itself rather than hand-rolled cleanup code.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS coordination_server (
    permanent_guid      TEXT PRIMARY KEY,
    current_public_key  TEXT NOT NULL UNIQUE,
    current_private_key TEXT NOT NULL,
    hostname            TEXT NOT NULL,
    vpn_ipv4            TEXT NOT NULL UNIQUE,
    vpn_ipv6            TEXT UNIQUE,
    endpoint_host       TEXT,
    endpoint_port       INTEGER,
    listen_port         INTEGER NOT NULL,
    vpn_network_v4      TEXT NOT NULL,
    vpn_network_v6      TEXT,
    ssh_host            TEXT NOT NULL,
    ssh_port            INTEGER NOT NULL,
    ssh_user            TEXT NOT NULL,
    ssh_remote_path     TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subnet_router (
    permanent_guid      TEXT PRIMARY KEY,
    cs_guid             TEXT NOT NULL REFERENCES coordination_server(permanent_guid),
    current_public_key  TEXT NOT NULL UNIQUE,
    current_private_key TEXT NOT NULL,
    hostname            TEXT NOT NULL,
    vpn_ipv4            TEXT NOT NULL UNIQUE,
    vpn_ipv6            TEXT UNIQUE,
    endpoint_host       TEXT,
    endpoint_port       INTEGER,
    listen_port         INTEGER,
    advertised_networks TEXT NOT NULL,
    lan_interface       TEXT NOT NULL,
    ssh_host            TEXT NOT NULL,
    ssh_port            INTEGER NOT NULL,
    ssh_user            TEXT NOT NULL,
    ssh_remote_path     TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS remote (
    permanent_guid      TEXT PRIMARY KEY,
    cs_guid             TEXT NOT NULL REFERENCES coordination_server(permanent_guid),
    current_public_key  TEXT NOT NULL UNIQUE,
    current_private_key TEXT NOT NULL,
    hostname            TEXT NOT NULL,
    vpn_ipv4            TEXT NOT NULL UNIQUE,
    vpn_ipv6            TEXT UNIQUE,
    endpoint_host       TEXT,
    endpoint_port       INTEGER,
    listen_port         INTEGER,
    access_level        TEXT NOT NULL,
    custom_allowed_ips  TEXT,
    device_type         TEXT,
    exit_node_guid      TEXT REFERENCES exit_node(permanent_guid),
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS exit_node (
    permanent_guid        TEXT PRIMARY KEY,
    cs_guid               TEXT NOT NULL REFERENCES coordination_server(permanent_guid),
    current_public_key    TEXT NOT NULL UNIQUE,
    current_private_key   TEXT NOT NULL,
    hostname              TEXT NOT NULL,
    vpn_ipv4              TEXT NOT NULL UNIQUE,
    vpn_ipv6              TEXT UNIQUE,
    endpoint_host         TEXT,
    endpoint_port         INTEGER,
    listen_port           INTEGER NOT NULL,
    wan_interface         TEXT NOT NULL,
    ssh_host              TEXT NOT NULL,
    ssh_port              INTEGER NOT NULL,
    ssh_user              TEXT NOT NULL,
    ssh_remote_path       TEXT NOT NULL,
    assigned_remote_count INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS key_rotation_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_guid      TEXT NOT NULL,
    entity_kind      TEXT NOT NULL,
    old_public_key   TEXT NOT NULL,
    new_public_key   TEXT,
    new_private_key  TEXT,
    rotated_at       TEXT NOT NULL,
    reason           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rotation_entity ON key_rotation_history(entity_guid, rotated_at);

CREATE TABLE IF NOT EXISTS comment (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_guid   TEXT NOT NULL,
    entity_kind   TEXT NOT NULL,
    category      TEXT NOT NULL,
    text          TEXT NOT NULL,
    position      TEXT NOT NULL,
    display_order INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comment_entity ON comment(entity_guid);

CREATE TABLE IF NOT EXISTS command_pair (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_guid     TEXT NOT NULL,
    entity_kind     TEXT NOT NULL,
    pattern_name    TEXT,
    up_commands     TEXT NOT NULL,
    down_commands   TEXT NOT NULL,
    variables       TEXT NOT NULL,
    scope           TEXT NOT NULL,
    execution_order INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_command_pair_entity ON command_pair(entity_guid);

CREATE TABLE IF NOT EXISTS command_singleton (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_guid      TEXT NOT NULL,
    entity_kind      TEXT NOT NULL,
    pattern_name     TEXT,
    direction_is_up  INTEGER NOT NULL,
    command          TEXT NOT NULL,
    variables        TEXT NOT NULL,
    scope            TEXT NOT NULL,
    execution_order  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_command_singleton_entity ON command_singleton(entity_guid);

CREATE TABLE IF NOT EXISTS peer_firewall_rule (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_guid        TEXT NOT NULL REFERENCES remote(permanent_guid) ON DELETE CASCADE,
    subnet_router_guid TEXT NOT NULL REFERENCES subnet_router(permanent_guid),
    target_ip_cidr     TEXT NOT NULL,
    allowed_ports      TEXT NOT NULL,
    rule_order         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_firewall_remote ON peer_firewall_rule(remote_guid);
CREATE INDEX IF NOT EXISTS idx_firewall_sr ON peer_firewall_rule(subnet_router_guid);

CREATE TABLE IF NOT EXISTS cs_peer_order (
    cs_guid       TEXT NOT NULL,
    entity_guid   TEXT NOT NULL,
    entity_kind   TEXT NOT NULL,
    display_order INTEGER NOT NULL,
    PRIMARY KEY (cs_guid, entity_guid, entity_kind)
);

CREATE TABLE IF NOT EXISTS extramural_sponsor (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS extramural_config (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    sponsor_id             INTEGER NOT NULL REFERENCES extramural_sponsor(id) ON DELETE CASCADE,
    local_private_key      TEXT NOT NULL,
    local_public_key       TEXT NOT NULL,
    local_address          TEXT NOT NULL,
    dns                    TEXT NOT NULL,
    pending_remote_update  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_extramural_config_sponsor ON extramural_config(sponsor_id);

CREATE TABLE IF NOT EXISTS extramural_server (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id   INTEGER NOT NULL REFERENCES extramural_config(id) ON DELETE CASCADE,
    label       TEXT NOT NULL,
    public_key  TEXT NOT NULL,
    preshared_key TEXT,
    endpoint    TEXT NOT NULL,
    allowed_ips TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_extramural_server_config ON extramural_server(config_id);
"#;
