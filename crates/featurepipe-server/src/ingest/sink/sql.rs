//! SQL rendering for the PostGIS sink
//!
//! Every identifier goes through [`quote_ident`]; values are always bound.

use super::{GeometryColumn, TableTarget};

/// PostgreSQL's limit on bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Columns of the attachment metadata table, in insert order
pub const ATTACHMENT_COLUMNS: [&str; 10] = [
    "attachment_id",
    "parent_id",
    "parent_global_id",
    "name",
    "size",
    "content_type",
    "keywords",
    "exif_info",
    "source_url",
    "storage_uri",
];

pub const CREATE_POSTGIS: &str = "CREATE EXTENSION IF NOT EXISTS postgis";

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Bind parameters used by one feature row
pub fn params_per_row(target: &TableTarget) -> usize {
    1 + target.columns.len() + usize::from(target.geometry.is_some())
}

/// Rows per INSERT statement that stay under the bind-parameter limit
pub fn rows_per_statement(params_per_row: usize) -> usize {
    (MAX_BIND_PARAMS / params_per_row.max(1)).max(1)
}

pub fn create_schema(target: &TableTarget) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&target.schema))
}

fn geometry_type(geometry: &GeometryColumn) -> String {
    format!("geometry(Geometry, {})", geometry.srid)
}

pub fn create_table(target: &TableTarget) -> String {
    let mut columns = vec![format!("{} bigint PRIMARY KEY", quote_ident(&target.key_column))];
    columns.extend(
        target
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.pg_type)),
    );
    if let Some(geometry) = &target.geometry {
        columns.push(format!("{} {}", quote_ident(&geometry.name), geometry_type(geometry)));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(&target.schema, &target.table),
        columns.join(", ")
    )
}

/// Statements that bring an existing table up to the target's shape
pub fn alter_table(target: &TableTarget) -> Vec<String> {
    let table = qualified(&target.schema, &target.table);
    let mut statements = vec![format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} bigint",
        table,
        quote_ident(&target.key_column)
    )];

    statements.extend(target.columns.iter().map(|c| {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            table,
            quote_ident(&c.name),
            c.pg_type
        )
    }));

    if let Some(geometry) = &target.geometry {
        statements.push(format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
            table,
            quote_ident(&geometry.name),
            geometry_type(geometry)
        ));
    }

    // ON CONFLICT needs a unique index when the key is not the primary key
    statements.push(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{}_{}_key", target.table, target.key_column)),
        table,
        quote_ident(&target.key_column)
    ));

    if let Some(geometry) = &target.geometry {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
            quote_ident(&format!("{}_{}_gist", target.table, geometry.name)),
            table,
            quote_ident(&geometry.name)
        ));
    }

    statements
}

pub fn create_attachments_table(target: &TableTarget) -> Option<Vec<String>> {
    let name = target.attachments_table.as_deref()?;
    let table = qualified(&target.schema, name);

    Some(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             attachment_id bigint PRIMARY KEY, \
             parent_id bigint NOT NULL, \
             parent_global_id text, \
             name text, \
             size bigint, \
             content_type text, \
             keywords text, \
             exif_info jsonb, \
             source_url text, \
             storage_uri text, \
             loaded_at timestamptz NOT NULL DEFAULT now())",
            table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (parent_id)",
            quote_ident(&format!("{}_parent_id", name)),
            table
        ),
    ])
}

pub fn truncate(schema: &str, table: &str) -> String {
    format!("TRUNCATE TABLE {}", qualified(schema, table))
}

pub fn delete_all(schema: &str, table: &str) -> String {
    format!("DELETE FROM {}", qualified(schema, table))
}

/// `INSERT INTO ... (key, columns.., geometry) ` ready for `push_values`
pub fn insert_prefix(target: &TableTarget) -> String {
    let mut columns = vec![quote_ident(&target.key_column)];
    columns.extend(target.columns.iter().map(|c| quote_ident(&c.name)));
    if let Some(geometry) = &target.geometry {
        columns.push(quote_ident(&geometry.name));
    }

    format!(
        "INSERT INTO {} ({}) ",
        qualified(&target.schema, &target.table),
        columns.join(", ")
    )
}

/// Conflict clause: every non-key column takes the incoming value
pub fn upsert_suffix(target: &TableTarget) -> String {
    let updates: Vec<String> = target
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .chain(target.geometry.as_ref().map(|g| g.name.as_str()))
        .map(|name| {
            let name = quote_ident(name);
            format!("{} = EXCLUDED.{}", name, name)
        })
        .collect();

    let key = quote_ident(&target.key_column);
    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", key)
    } else {
        format!(" ON CONFLICT ({}) DO UPDATE SET {}", key, updates.join(", "))
    }
}

/// SQL wrapped around the bound GeoJSON parameter of a geometry value
pub fn geometry_expr(geometry: &GeometryColumn) -> (String, String) {
    match geometry.source_srid {
        Some(source) => (
            "ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(".to_string(),
            format!("), {}), {})", source, geometry.srid),
        ),
        None => (
            "ST_SetSRID(ST_GeomFromGeoJSON(".to_string(),
            format!("), {})", geometry.srid),
        ),
    }
}

pub fn attachment_insert_prefix(schema: &str, table: &str) -> String {
    format!(
        "INSERT INTO {} AS existing ({}) ",
        qualified(schema, table),
        ATTACHMENT_COLUMNS.join(", ")
    )
}

/// A failed re-upload keeps the previously archived URI
pub fn attachment_upsert_suffix() -> String {
    let updates: Vec<String> = ATTACHMENT_COLUMNS[1..]
        .iter()
        .map(|c| {
            if *c == "storage_uri" {
                "storage_uri = COALESCE(EXCLUDED.storage_uri, existing.storage_uri)".to_string()
            } else {
                format!("{} = EXCLUDED.{}", c, c)
            }
        })
        .collect();

    format!(
        " ON CONFLICT (attachment_id) DO UPDATE SET {}, loaded_at = now()",
        updates.join(", ")
    )
}
