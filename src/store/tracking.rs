//! Order/shipment lookup backed by the `tracking_orders` table.
//!
//! Every query runs through [`PooledResource::with_retry`], so a stale
//! connection is rebuilt and the query retried before an error surfaces.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::pool::PooledResource;
use crate::error::DatabaseError;

/// Label reported as the data source of every lookup.
pub const DATA_SOURCE: &str = "libsql";

/// Shipment status as stored in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingStatus {
    PedidoConfirmado,
    Coletado,
    EmTransito,
    SaiuParaEntrega,
    Entregue,
    TentativaEntrega,
    Devolvido,
    Extraviado,
    #[default]
    NaoEncontrado,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PedidoConfirmado => "PEDIDO_CONFIRMADO",
            Self::Coletado => "COLETADO",
            Self::EmTransito => "EM_TRANSITO",
            Self::SaiuParaEntrega => "SAIU_PARA_ENTREGA",
            Self::Entregue => "ENTREGUE",
            Self::TentativaEntrega => "TENTATIVA_ENTREGA",
            Self::Devolvido => "DEVOLVIDO",
            Self::Extraviado => "EXTRAVIADO",
            Self::NaoEncontrado => "NAO_ENCONTRADO",
        }
    }

    /// Unknown strings map to `NaoEncontrado`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "PEDIDO_CONFIRMADO" => Self::PedidoConfirmado,
            "COLETADO" => Self::Coletado,
            "EM_TRANSITO" => Self::EmTransito,
            "SAIU_PARA_ENTREGA" => Self::SaiuParaEntrega,
            "ENTREGUE" => Self::Entregue,
            "TENTATIVA_ENTREGA" => Self::TentativaEntrega,
            "DEVOLVIDO" => Self::Devolvido,
            "EXTRAVIADO" => Self::Extraviado,
            "NAO_ENCONTRADO" => Self::NaoEncontrado,
            other => {
                warn!(status = other, "Unknown tracking status");
                Self::NaoEncontrado
            }
        }
    }
}

/// Shipping carrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Carrier {
    Correios,
    #[serde(rename = "Mercado Envios")]
    MercadoEnvios,
    Loggi,
    #[serde(rename = "Total Express")]
    TotalExpress,
    JadLog,
    Sequoia,
    #[default]
    Outro,
}

impl Carrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correios => "Correios",
            Self::MercadoEnvios => "Mercado Envios",
            Self::Loggi => "Loggi",
            Self::TotalExpress => "Total Express",
            Self::JadLog => "JadLog",
            Self::Sequoia => "Sequoia",
            Self::Outro => "Outro",
        }
    }

    /// Exact display name first, then a case-insensitive substring match.
    pub fn from_name(name: &str) -> Self {
        const EXACT: &[Carrier] = &[
            Carrier::Correios,
            Carrier::MercadoEnvios,
            Carrier::Loggi,
            Carrier::TotalExpress,
            Carrier::JadLog,
            Carrier::Sequoia,
            Carrier::Outro,
        ];
        if let Some(c) = EXACT.iter().find(|c| c.as_str() == name) {
            return *c;
        }

        const FUZZY: &[(&str, Carrier)] = &[
            ("correios", Carrier::Correios),
            ("mercado", Carrier::MercadoEnvios),
            ("loggi", Carrier::Loggi),
            ("total", Carrier::TotalExpress),
            ("jadlog", Carrier::JadLog),
            ("sequoia", Carrier::Sequoia),
        ];
        let lower = name.to_lowercase();
        FUZZY
            .iter()
            .find(|(needle, _)| lower.contains(needle))
            .map(|(_, c)| *c)
            .unwrap_or(Carrier::Outro)
    }
}

/// One movement in a shipment's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A shipment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(default)]
    pub customer_email: String,
    pub order_id: String,
    #[serde(default)]
    pub tracking_code: String,
    #[serde(default)]
    pub carrier: Carrier,
    #[serde(default)]
    pub status: TrackingStatus,
    #[serde(default = "Utc::now")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub last_location: Option<String>,
    #[serde(default)]
    pub estimated_delivery: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<TrackingEvent>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub recipient_document: Option<String>,
    #[serde(default)]
    pub delivery_address: Option<String>,
}

/// Outcome of a tracking query for one email.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingQueryResult {
    pub email_id: String,
    pub found: bool,
    pub tracking_data: Option<OrderRecord>,
    pub query_time_ms: u64,
    pub data_source: &'static str,
    pub error: Option<String>,
    pub suggestions: Vec<String>,
}

const NOT_FOUND_SUGGESTIONS: &[&str] = &[
    "Check that the email address is correct",
    "The order may still be processing",
    "Contact support for more information",
];

const ORDER_COLUMNS: &str = "customer_email, order_id, tracking_code, carrier, status, last_update, last_location, estimated_delivery, delivered_at, tracking_json, recipient_name, recipient_document, delivery_address";

/// Tracking lookups over the pooled database.
pub struct TrackingStore {
    pool: Arc<PooledResource>,
}

impl TrackingStore {
    pub fn new(pool: Arc<PooledResource>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<PooledResource> {
        &self.pool
    }

    /// Most recently updated order for a customer, optionally a specific one.
    pub async fn find_by_customer(
        &self,
        email: &str,
        order_id: Option<&str>,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        let record = self
            .pool
            .with_retry(|conn| async move {
                let mut rows = match order_id {
                    Some(order_id) => conn
                        .query(
                            &format!(
                                "SELECT {ORDER_COLUMNS} FROM tracking_orders
                                 WHERE customer_email = ?1 AND order_id = ?2
                                 ORDER BY last_update DESC LIMIT 1"
                            ),
                            params![email, order_id],
                        )
                        .await,
                    None => conn
                        .query(
                            &format!(
                                "SELECT {ORDER_COLUMNS} FROM tracking_orders
                                 WHERE customer_email = ?1
                                 ORDER BY last_update DESC LIMIT 1"
                            ),
                            params![email],
                        )
                        .await,
                }
                .map_err(DatabaseError::from_libsql)?;

                match rows.next().await.map_err(DatabaseError::from_libsql)? {
                    Some(row) => row_to_order(&row).map(Some),
                    None => Ok(None),
                }
            })
            .await?;

        debug!(email, ?order_id, found = record.is_some(), "Tracking lookup");
        Ok(record)
    }

    /// Up to `limit` orders for a customer, most recent first.
    pub async fn find_all_by_customer(
        &self,
        email: &str,
        limit: u32,
    ) -> Result<Vec<OrderRecord>, DatabaseError> {
        self.pool
            .with_retry(|conn| async move {
                let mut rows = conn
                    .query(
                        &format!(
                            "SELECT {ORDER_COLUMNS} FROM tracking_orders
                             WHERE customer_email = ?1
                             ORDER BY last_update DESC LIMIT ?2"
                        ),
                        params![email, i64::from(limit)],
                    )
                    .await
                    .map_err(DatabaseError::from_libsql)?;

                let mut orders = Vec::new();
                while let Some(row) = rows.next().await.map_err(DatabaseError::from_libsql)? {
                    orders.push(row_to_order(&row)?);
                }
                Ok(orders)
            })
            .await
    }

    /// Insert an order, or update status/location/history if it exists.
    pub async fn upsert_order(&self, order: &OrderRecord) -> Result<(), DatabaseError> {
        let history = serde_json::to_string(&order.history)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.pool
            .with_retry(|conn: Connection| {
                let history = history.clone();
                async move {
                    let now = Utc::now().to_rfc3339();
                    conn.execute(
                        "INSERT INTO tracking_orders (
                            customer_email, order_id, tracking_code, carrier, status,
                            last_location, last_update, estimated_delivery, delivered_at,
                            recipient_name, recipient_document, delivery_address,
                            tracking_json, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                        ON CONFLICT (customer_email, order_id) DO UPDATE SET
                            status = excluded.status,
                            last_location = excluded.last_location,
                            last_update = excluded.last_update,
                            delivered_at = excluded.delivered_at,
                            tracking_json = excluded.tracking_json,
                            updated_at = excluded.updated_at",
                        params![
                            order.customer_email.as_str(),
                            order.order_id.as_str(),
                            order.tracking_code.as_str(),
                            order.carrier.as_str(),
                            order.status.as_str(),
                            opt_text(order.last_location.as_deref()),
                            order.last_update.to_rfc3339(),
                            opt_text(order.estimated_delivery.map(|d| d.to_rfc3339()).as_deref()),
                            opt_text(order.delivered_at.map(|d| d.to_rfc3339()).as_deref()),
                            opt_text(order.recipient_name.as_deref()),
                            opt_text(order.recipient_document.as_deref()),
                            opt_text(order.delivery_address.as_deref()),
                            history,
                            now,
                        ],
                    )
                    .await
                    .map_err(DatabaseError::from_libsql)?;
                    Ok(())
                }
            })
            .await?;

        info!(order_id = %order.order_id, "Tracking data inserted/updated");
        Ok(())
    }

    /// Probe the database end to end.
    pub async fn test_connection(&self) -> bool {
        match self.pool.with_retry(|_conn| async { Ok(()) }).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Tracking database connection test failed");
                false
            }
        }
    }

    /// Look up tracking for an email sender. Failures are reported in the
    /// result instead of raised.
    pub async fn query_tracking(
        &self,
        email_id: &str,
        sender: &str,
        order_id: Option<&str>,
    ) -> TrackingQueryResult {
        let start = Instant::now();
        let lookup = self.find_by_customer(sender, order_id).await;
        let query_time_ms = start.elapsed().as_millis() as u64;

        match lookup {
            Ok(Some(record)) => TrackingQueryResult {
                email_id: email_id.to_string(),
                found: true,
                tracking_data: Some(record),
                query_time_ms,
                data_source: DATA_SOURCE,
                error: None,
                suggestions: Vec::new(),
            },
            Ok(None) => TrackingQueryResult {
                email_id: email_id.to_string(),
                found: false,
                tracking_data: None,
                query_time_ms,
                data_source: DATA_SOURCE,
                error: None,
                suggestions: NOT_FOUND_SUGGESTIONS.iter().map(|s| s.to_string()).collect(),
            },
            Err(e) => {
                error!(email_id, error = %e, "Tracking query failed");
                TrackingQueryResult {
                    email_id: email_id.to_string(),
                    found: false,
                    tracking_data: None,
                    query_time_ms,
                    data_source: DATA_SOURCE,
                    error: Some(e.to_string()),
                    suggestions: Vec::new(),
                }
            }
        }
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    None
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_history(raw: Option<&str>) -> Vec<TrackingEvent> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<TrackingEvent>>(raw) {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "Failed to parse tracking history");
            Vec::new()
        }
    }
}

/// Column order matches ORDER_COLUMNS.
fn row_to_order(row: &libsql::Row) -> Result<OrderRecord, DatabaseError> {
    let text = |idx: i32| -> Result<Option<String>, DatabaseError> {
        let value = row
            .get_value(idx)
            .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))?;
        match value {
            libsql::Value::Null => Ok(None),
            libsql::Value::Text(s) => Ok(Some(s)),
            libsql::Value::Integer(i) => Ok(Some(i.to_string())),
            libsql::Value::Real(f) => Ok(Some(f.to_string())),
            libsql::Value::Blob(_) => Err(DatabaseError::Serialization(format!(
                "column {idx}: unexpected blob"
            ))),
        }
    };

    let customer_email = text(0)?.unwrap_or_default();
    let order_id = text(1)?.unwrap_or_default();
    let last_update = text(5)?
        .as_deref()
        .and_then(parse_datetime)
        .unwrap_or_else(Utc::now);

    Ok(OrderRecord {
        customer_email,
        order_id,
        tracking_code: text(2)?.unwrap_or_default(),
        carrier: text(3)?
            .as_deref()
            .map(Carrier::from_name)
            .unwrap_or_default(),
        status: text(4)?
            .as_deref()
            .map(TrackingStatus::parse)
            .unwrap_or_default(),
        last_update,
        last_location: text(6)?,
        estimated_delivery: text(7)?.as_deref().and_then(parse_datetime),
        delivered_at: text(8)?.as_deref().and_then(parse_datetime),
        history: parse_history(text(9)?.as_deref()),
        recipient_name: text(10)?,
        recipient_document: text(11)?,
        delivery_address: text(12)?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::resilience::RetryPolicy;
    use crate::store::pool::PoolTarget;

    async fn store() -> TrackingStore {
        let pool = PooledResource::new(
            PoolTarget::Memory,
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        pool.init().await.unwrap();
        TrackingStore::new(Arc::new(pool))
    }

    fn order(email: &str, order_id: &str, day: u32) -> OrderRecord {
        OrderRecord {
            customer_email: email.to_string(),
            order_id: order_id.to_string(),
            tracking_code: format!("BR{order_id}BR"),
            carrier: Carrier::Correios,
            status: TrackingStatus::EmTransito,
            last_update: Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap(),
            last_location: Some("Curitiba/PR".to_string()),
            estimated_delivery: None,
            delivered_at: None,
            history: vec![TrackingEvent {
                date: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap(),
                status: "Postado".to_string(),
                location: Some("São Paulo/SP".to_string()),
                description: None,
            }],
            recipient_name: None,
            recipient_document: None,
            delivery_address: None,
        }
    }

    #[test]
    fn carrier_fuzzy_matching() {
        assert_eq!(Carrier::from_name("Correios"), Carrier::Correios);
        assert_eq!(Carrier::from_name("MERCADO LIVRE ENVIOS"), Carrier::MercadoEnvios);
        assert_eq!(Carrier::from_name("total express ltda"), Carrier::TotalExpress);
        assert_eq!(Carrier::from_name("DHL"), Carrier::Outro);
    }

    #[test]
    fn unknown_status_is_not_found() {
        assert_eq!(TrackingStatus::parse("ENTREGUE"), TrackingStatus::Entregue);
        assert_eq!(TrackingStatus::parse("shipped"), TrackingStatus::NaoEncontrado);
    }

    #[test]
    fn history_parse_tolerates_garbage() {
        assert!(parse_history(Some("not json")).is_empty());
        assert!(parse_history(None).is_empty());
        let parsed = parse_history(Some(
            r#"[{"date": "2025-01-04T10:00:00Z", "status": "Postado", "location": "SP"}]"#,
        ));
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].location.as_deref(), Some("SP"));
    }

    #[tokio::test]
    async fn finds_latest_order_for_customer() {
        let store = store().await;
        store.upsert_order(&order("c@x.com", "111", 3)).await.unwrap();
        store.upsert_order(&order("c@x.com", "222", 9)).await.unwrap();
        store.upsert_order(&order("other@x.com", "333", 20)).await.unwrap();

        let latest = store.find_by_customer("c@x.com", None).await.unwrap().unwrap();
        assert_eq!(latest.order_id, "222");
        assert_eq!(latest.history.len(), 1);
        assert_eq!(latest.carrier, Carrier::Correios);

        let specific = store
            .find_by_customer("c@x.com", Some("111"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(specific.order_id, "111");

        assert!(store.find_by_customer("nobody@x.com", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_all_respects_limit_and_order() {
        let store = store().await;
        for day in 1..=7 {
            store
                .upsert_order(&order("c@x.com", &format!("{day:05}"), day))
                .await
                .unwrap();
        }

        let orders = store.find_all_by_customer("c@x.com", 5).await.unwrap();
        assert_eq!(orders.len(), 5);
        assert_eq!(orders[0].order_id, "00007");
        assert_eq!(orders[4].order_id, "00003");
    }

    #[tokio::test]
    async fn upsert_updates_status_in_place() {
        let store = store().await;
        let mut record = order("c@x.com", "111", 3);
        store.upsert_order(&record).await.unwrap();

        record.status = TrackingStatus::Entregue;
        record.last_update = Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap();
        store.upsert_order(&record).await.unwrap();

        let all = store.find_all_by_customer("c@x.com", 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TrackingStatus::Entregue);
    }

    #[tokio::test]
    async fn query_tracking_reports_not_found_with_suggestions() {
        let store = store().await;
        let result = store.query_tracking("msg_1", "ghost@x.com", None).await;
        assert!(!result.found);
        assert!(result.error.is_none());
        assert_eq!(result.suggestions.len(), 3);
        assert_eq!(result.data_source, DATA_SOURCE);
    }

    #[tokio::test]
    async fn query_tracking_found() {
        let store = store().await;
        store.upsert_order(&order("c@x.com", "111", 3)).await.unwrap();
        let result = store.query_tracking("msg_1", "c@x.com", Some("111")).await;
        assert!(result.found);
        assert!(result.suggestions.is_empty());
        assert_eq!(result.tracking_data.unwrap().tracking_code, "BR111BR");
    }

    #[tokio::test]
    async fn connection_test_passes_on_open_pool() {
        let store = store().await;
        assert!(store.test_connection().await);
    }
}
