//! SQLite-backed [`BracketStore`].
//!
//! Decimals are stored as TEXT, timestamps as RFC 3339, enums as their
//! snake_case names and child references / risk snapshots as JSON.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{BracketStore, GroupRecord};
use crate::model::{
    parse_client_id, BracketLink, BracketStatus, ExternalOperation, GroupId, OperationStatus,
    Order, OrderId,
};

const ORDER_COLUMNS: &str = "id, symbol, account, side, role, quantity, price, filled_quantity, \
     avg_fill_price, status, exchange_order_id, client_order_id, parent, children, risk_snapshot, \
     created_at, updated_at";

const GROUP_COLUMNS: &str = "group_id, symbol, account, direction, entry_order, entry_client_id, \
     take_profit_order, take_profit_client_id, stop_loss_order, stop_loss_client_id, status, \
     close_reason, status_note, last_observed_quantity, unresolved_since, created_at, updated_at";

const OPERATION_COLUMNS: &str =
    "id, group_id, symbol, operation_type, old_amount, new_amount, confidence, status, detected_at";

/// SQLite-based bracket store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Bracket store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store, used by tests and paper runs.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Bracket member orders
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY,
                group_id TEXT,
                symbol TEXT NOT NULL,
                account TEXT NOT NULL,
                side TEXT NOT NULL,
                role TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                filled_quantity TEXT NOT NULL,
                avg_fill_price TEXT,
                status TEXT NOT NULL,
                exchange_order_id TEXT,
                client_order_id TEXT NOT NULL UNIQUE,
                parent INTEGER,
                children TEXT NOT NULL DEFAULT '[]',
                risk_snapshot TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_group ON orders(group_id);

            -- Bracket groups
            CREATE TABLE IF NOT EXISTS bracket_groups (
                group_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                account TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_order INTEGER NOT NULL,
                entry_client_id TEXT NOT NULL,
                take_profit_order INTEGER,
                take_profit_client_id TEXT,
                stop_loss_order INTEGER,
                stop_loss_client_id TEXT,
                status TEXT NOT NULL,
                close_reason TEXT,
                status_note TEXT,
                last_observed_quantity TEXT,
                unresolved_since TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_groups_status ON bracket_groups(status);
            CREATE INDEX IF NOT EXISTS idx_groups_symbol ON bracket_groups(symbol, account);

            -- Out-of-band position changes
            CREATE TABLE IF NOT EXISTS external_operations (
                id INTEGER PRIMARY KEY,
                group_id TEXT,
                symbol TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                old_amount TEXT NOT NULL,
                new_amount TEXT NOT NULL,
                confidence TEXT NOT NULL,
                status TEXT NOT NULL,
                detected_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_operations_detected ON external_operations(detected_at);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn opt_decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_time(idx, &raw)
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_time(idx, &raw))
        .transpose()
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn enum_at<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_enum_at<T: FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| raw.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let children: String = row.get(13)?;
    let children: Vec<u64> =
        serde_json::from_str(&children).map_err(|e| conversion_error(13, e.to_string()))?;
    let risk_snapshot = row
        .get::<_, Option<String>>(14)?
        .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(14, e.to_string())))
        .transpose()?;

    Ok(Order {
        id: OrderId(row.get(0)?),
        symbol: row.get(1)?,
        account: row.get(2)?,
        side: enum_at(row, 3)?,
        role: enum_at(row, 4)?,
        quantity: decimal_at(row, 5)?,
        price: opt_decimal_at(row, 6)?,
        filled_quantity: decimal_at(row, 7)?,
        avg_fill_price: opt_decimal_at(row, 8)?,
        status: enum_at(row, 9)?,
        exchange_order_id: row.get(10)?,
        client_order_id: row.get(11)?,
        parent: row.get::<_, Option<u64>>(12)?.map(OrderId),
        children: children.into_iter().map(OrderId).collect(),
        risk_snapshot,
        created_at: time_at(row, 15)?,
        updated_at: time_at(row, 16)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<BracketLink> {
    Ok(BracketLink {
        group_id: GroupId::from(row.get::<_, String>(0)?.as_str()),
        symbol: row.get(1)?,
        account: row.get(2)?,
        direction: enum_at(row, 3)?,
        entry_order: OrderId(row.get(4)?),
        entry_client_id: row.get(5)?,
        take_profit_order: row.get::<_, Option<u64>>(6)?.map(OrderId),
        take_profit_client_id: row.get(7)?,
        stop_loss_order: row.get::<_, Option<u64>>(8)?.map(OrderId),
        stop_loss_client_id: row.get(9)?,
        status: enum_at(row, 10)?,
        close_reason: opt_enum_at(row, 11)?,
        status_note: row.get(12)?,
        last_observed_quantity: opt_decimal_at(row, 13)?,
        unresolved_since: opt_time_at(row, 14)?,
        created_at: time_at(row, 15)?,
        updated_at: time_at(row, 16)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalOperation> {
    Ok(ExternalOperation {
        id: row.get(0)?,
        group_id: row
            .get::<_, Option<String>>(1)?
            .map(|g| GroupId::from(g.as_str())),
        symbol: row.get(2)?,
        operation_type: enum_at(row, 3)?,
        old_amount: decimal_at(row, 4)?,
        new_amount: decimal_at(row, 5)?,
        confidence: decimal_at(row, 6)?,
        status: enum_at(row, 7)?,
        detected_at: time_at(row, 8)?,
    })
}

fn orders_for_group(conn: &Connection, group_id: &GroupId) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE group_id = ?1 ORDER BY id"
    ))?;
    let orders = stmt
        .query_map([group_id.as_str()], order_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(orders)
}

impl BracketStore for SqliteStore {
    fn save_order(&self, order: &Order) -> Result<()> {
        let group_id = parse_client_id(&order.client_order_id).map(|(g, _)| g);
        let children: Vec<u64> = order.children.iter().map(|c| c.0).collect();
        let risk_snapshot = order
            .risk_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO orders (group_id, {ORDER_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                group_id.as_ref().map(|g| g.as_str()),
                order.id.0,
                order.symbol,
                order.account,
                order.side.as_str(),
                order.role.as_str(),
                order.quantity.to_string(),
                order.price.map(|p| p.to_string()),
                order.filled_quantity.to_string(),
                order.avg_fill_price.map(|p| p.to_string()),
                order.status.as_str(),
                order.exchange_order_id,
                order.client_order_id,
                order.parent.map(|p| p.0),
                serde_json::to_string(&children)?,
                risk_snapshot,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn save_group(&self, link: &BracketLink) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO bracket_groups ({GROUP_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                link.group_id.as_str(),
                link.symbol,
                link.account,
                link.direction.as_str(),
                link.entry_order.0,
                link.entry_client_id,
                link.take_profit_order.map(|o| o.0),
                link.take_profit_client_id,
                link.stop_loss_order.map(|o| o.0),
                link.stop_loss_client_id,
                link.status.as_str(),
                link.close_reason.map(|r| r.as_str()),
                link.status_note,
                link.last_observed_quantity.map(|q| q.to_string()),
                link.unresolved_since.map(|t| t.to_rfc3339()),
                link.created_at.to_rfc3339(),
                link.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_external_operation(&self, operation: &ExternalOperation) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO external_operations ({OPERATION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                operation.id,
                operation.group_id.as_ref().map(|g| g.as_str()),
                operation.symbol,
                operation.operation_type.as_str(),
                operation.old_amount.to_string(),
                operation.new_amount.to_string(),
                operation.confidence.to_string(),
                operation.status.as_str(),
                operation.detected_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_external_operation_status(&self, id: u64, status: OperationStatus) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE external_operations SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        anyhow::ensure!(changed == 1, "external operation {id} not found");
        Ok(())
    }

    fn load_group_with_orders(&self, group_id: &GroupId) -> Result<Option<GroupRecord>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let link = tx
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM bracket_groups WHERE group_id = ?1"),
                [group_id.as_str()],
                group_from_row,
            )
            .optional()?;

        let Some(link) = link else {
            return Ok(None);
        };

        let orders = orders_for_group(&tx, group_id)?;
        tx.commit()?;
        Ok(Some((link, orders)))
    }

    fn compare_and_set_group_status(
        &self,
        expected: BracketStatus,
        updated: &BracketLink,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE bracket_groups
            SET status = ?1, close_reason = ?2, status_note = ?3, updated_at = ?4
            WHERE group_id = ?5 AND status = ?6
            "#,
            params![
                updated.status.as_str(),
                updated.close_reason.map(|r| r.as_str()),
                updated.status_note,
                updated.updated_at.to_rfc3339(),
                updated.group_id.as_str(),
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn load_active_groups(&self) -> Result<Vec<GroupRecord>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let links = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {GROUP_COLUMNS} FROM bracket_groups WHERE status = ?1 ORDER BY created_at"
            ))?;
            let links = stmt
                .query_map([BracketStatus::Active.as_str()], group_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            links
        };

        let mut records = Vec::with_capacity(links.len());
        for link in links {
            let orders = orders_for_group(&tx, &link.group_id)?;
            records.push((link, orders));
        }
        tx.commit()?;

        debug!(groups = records.len(), "Loaded active bracket groups");
        Ok(records)
    }

    fn list_groups(&self, limit: usize) -> Result<Vec<BracketLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM bracket_groups ORDER BY created_at DESC, group_id DESC LIMIT ?1"
        ))?;
        let links = stmt
            .query_map([limit], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    fn list_external_operations(&self, limit: usize) -> Result<Vec<ExternalOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM external_operations ORDER BY detected_at DESC, id DESC LIMIT ?1"
        ))?;
        let operations = stmt
            .query_map([limit], operation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn max_order_id(&self) -> Result<u64> {
        let max: Option<u64> =
            self.conn()?
                .query_row("SELECT MAX(id) FROM orders", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    fn max_external_operation_id(&self) -> Result<u64> {
        let max: Option<u64> = self.conn()?.query_row(
            "SELECT MAX(id) FROM external_operations",
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CloseReason, OperationType, OrderRole, OrderSide, OrderStatus, PositionDirection,
    };
    use crate::risk::{BaseRiskSettings, MarketRegime, RiskInputs, RiskProfileResolver};
    use rust_decimal_macros::dec;

    fn sample_group() -> (BracketLink, Vec<Order>) {
        let now = Utc::now();
        let group_id = GroupId::new(OrderId(1), now);
        let risk = RiskProfileResolver::resolve(&RiskInputs::new(
            BaseRiskSettings::default(),
            dec!(3),
            MarketRegime::Normal,
        ))
        .unwrap();

        let order = |id: u64, role: OrderRole, side: OrderSide, price: Option<Decimal>| Order {
            id: OrderId(id),
            symbol: "BTCUSDT".to_string(),
            account: "main".to_string(),
            side,
            role,
            quantity: dec!(0.5),
            price,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Submitted,
            exchange_order_id: Some(format!("ex-{id}")),
            client_order_id: group_id.client_order_id(role),
            parent: (role != OrderRole::Entry).then_some(OrderId(1)),
            children: Vec::new(),
            risk_snapshot: (role == OrderRole::Entry).then_some(risk),
            created_at: now,
            updated_at: now,
        };

        let mut entry = order(1, OrderRole::Entry, OrderSide::LongOpen, None);
        entry.children = vec![OrderId(2), OrderId(3)];
        entry.filled_quantity = dec!(0.5);
        entry.avg_fill_price = Some(dec!(50000));
        entry.status = OrderStatus::Filled;
        let tp = order(2, OrderRole::TakeProfit, OrderSide::ReduceOnlyClose, Some(dec!(53000)));
        let sl = order(3, OrderRole::StopLoss, OrderSide::ReduceOnlyClose, Some(dec!(47750)));

        let link = BracketLink {
            group_id: group_id.clone(),
            symbol: "BTCUSDT".to_string(),
            account: "main".to_string(),
            direction: PositionDirection::Long,
            entry_order: OrderId(1),
            entry_client_id: entry.client_order_id.clone(),
            take_profit_order: Some(OrderId(2)),
            take_profit_client_id: Some(tp.client_order_id.clone()),
            stop_loss_order: Some(OrderId(3)),
            stop_loss_client_id: Some(sl.client_order_id.clone()),
            status: BracketStatus::Active,
            close_reason: None,
            status_note: None,
            last_observed_quantity: Some(dec!(0.5)),
            unresolved_since: None,
            created_at: now,
            updated_at: now,
        };

        (link, vec![entry, tp, sl])
    }

    #[test]
    fn test_save_and_load_group_with_orders() {
        let store = SqliteStore::in_memory().unwrap();
        let (link, orders) = sample_group();

        store.save_group(&link).unwrap();
        for order in &orders {
            store.save_order(order).unwrap();
        }

        let (loaded, members) = store.load_group_with_orders(&link.group_id).unwrap().unwrap();
        assert_eq!(loaded.group_id, link.group_id);
        assert_eq!(loaded.stop_loss_order, Some(OrderId(3)));
        assert_eq!(loaded.last_observed_quantity, Some(dec!(0.5)));
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].children, vec![OrderId(2), OrderId(3)]);
        assert_eq!(members[0].avg_fill_price, Some(dec!(50000)));
        assert!(members[0].risk_snapshot.is_some());
        assert_eq!(members[2].price, Some(dec!(47750)));
        assert_eq!(store.max_order_id().unwrap(), 3);

        assert!(store
            .load_group_with_orders(&GroupId::from("9-1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_compare_and_set_group_status() {
        let store = SqliteStore::in_memory().unwrap();
        let (mut link, _) = sample_group();
        store.save_group(&link).unwrap();

        link.status = BracketStatus::Closed;
        link.close_reason = Some(CloseReason::TakeProfitFilled);
        assert!(store
            .compare_and_set_group_status(BracketStatus::Active, &link)
            .unwrap());
        // Second attempt sees the terminal status and does nothing
        assert!(!store
            .compare_and_set_group_status(BracketStatus::Active, &link)
            .unwrap());

        assert!(store.load_active_groups().unwrap().is_empty());
        let listed = store.list_groups(10).unwrap();
        assert_eq!(listed[0].close_reason, Some(CloseReason::TakeProfitFilled));
    }

    #[test]
    fn test_external_operations() {
        let store = SqliteStore::in_memory().unwrap();
        let operation = ExternalOperation {
            id: 1,
            group_id: Some(GroupId::from("1-1700000000")),
            symbol: "BTCUSDT".to_string(),
            operation_type: OperationType::ExternalFullClose,
            old_amount: dec!(0.5),
            new_amount: Decimal::ZERO,
            confidence: dec!(0.9),
            status: OperationStatus::Detected,
            detected_at: Utc::now(),
        };

        store.record_external_operation(&operation).unwrap();
        store
            .update_external_operation_status(1, OperationStatus::Handled)
            .unwrap();
        assert!(store
            .update_external_operation_status(42, OperationStatus::Handled)
            .is_err());

        let listed = store.list_external_operations(5).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, OperationStatus::Handled);
        assert_eq!(listed[0].confidence, dec!(0.9));
        assert_eq!(store.max_external_operation_id().unwrap(), 1);
    }
}
