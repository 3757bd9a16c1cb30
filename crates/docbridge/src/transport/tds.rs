//! TDS transport implementation backed by tiberius.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::transport::{QueryResult, Transport};
use crate::value::SqlValue;

/// Transport speaking TDS to SQL Server.
#[derive(Debug, Default, Clone)]
pub struct TdsTransport;

impl TdsTransport {
    /// Create a new TDS transport.
    pub fn new() -> Self {
        Self
    }

    fn build_config(server: &ServerConfig) -> Config {
        let mut config = Config::new();
        config.host(&server.host);
        config.port(server.port);
        config.database(&server.database);
        if let Some(instance) = &server.instance {
            config.instance_name(instance);
        }
        config.authentication(AuthMethod::sql_server(&server.user, &server.password));

        if server.encrypt {
            if server.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl Transport for TdsTransport {
    type Conn = Client<Compat<TcpStream>>;

    async fn connect(&self, server: &ServerConfig) -> Result<Self::Conn> {
        let config = Self::build_config(server);
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write()).await?;
        debug!(
            "Connected to {}:{}/{}",
            server.host, server.port, server.database
        );
        Ok(client)
    }

    async fn query(
        &self,
        conn: &mut Self::Conn,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult> {
        let mut query = Query::new(sql);
        bind_params(&mut query, params);

        let mut stream = query.query(conn).await?;
        let columns = stream
            .columns()
            .await?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let raw_rows = stream.into_first_result().await?;
        let mut rows = Vec::with_capacity(raw_rows.len());
        for row in raw_rows {
            rows.push(row.into_iter().map(convert_column).collect::<Result<_>>()?);
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: 0,
        })
    }

    async fn execute(&self, conn: &mut Self::Conn, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut query = Query::new(sql);
        bind_params(&mut query, params);

        let result = query.execute(conn).await?;
        Ok(result.total())
    }

    async fn close(&self, conn: Self::Conn) {
        if let Err(e) = conn.close().await {
            warn!("Error closing connection: {e}");
        }
    }
}

/// Bind `SqlValue` parameters positionally (`@P1`, `@P2`, ...).
fn bind_params<'a>(query: &mut Query<'a>, params: &'a [SqlValue]) {
    for param in params {
        match param {
            SqlValue::Null => query.bind(Option::<&str>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::I16(v) => query.bind(*v),
            SqlValue::I32(v) => query.bind(*v),
            SqlValue::I64(v) => query.bind(*v),
            SqlValue::F32(v) => query.bind(*v),
            SqlValue::F64(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::Decimal(v) => {
                query.bind(Numeric::new_with_scale(v.mantissa(), v.scale() as u8))
            }
            SqlValue::DateTime(v) => query.bind(*v),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Time(v) => query.bind(*v),
        }
    }
}

/// Convert wire column data into a `SqlValue`.
fn convert_column(data: ColumnData<'static>) -> Result<SqlValue> {
    Ok(match data {
        ColumnData::Bit(v) => v.map(SqlValue::Bool).unwrap_or(SqlValue::Null),
        ColumnData::U8(v) => v.map(|x| SqlValue::I16(x as i16)).unwrap_or(SqlValue::Null),
        ColumnData::I16(v) => v.map(SqlValue::I16).unwrap_or(SqlValue::Null),
        ColumnData::I32(v) => v.map(SqlValue::I32).unwrap_or(SqlValue::Null),
        ColumnData::I64(v) => v.map(SqlValue::I64).unwrap_or(SqlValue::Null),
        ColumnData::F32(v) => v.map(SqlValue::F32).unwrap_or(SqlValue::Null),
        ColumnData::F64(v) => v.map(SqlValue::F64).unwrap_or(SqlValue::Null),
        ColumnData::String(v) => v
            .map(|s| SqlValue::Text(s.into_owned()))
            .unwrap_or(SqlValue::Null),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid).unwrap_or(SqlValue::Null),
        ColumnData::Binary(v) => v
            .map(|b| SqlValue::Bytes(b.into_owned()))
            .unwrap_or(SqlValue::Null),
        data @ ColumnData::Numeric(_) => Decimal::from_sql(&data)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null),
        data @ (ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_)) => {
            NaiveDateTime::from_sql(&data)?
                .map(SqlValue::DateTime)
                .unwrap_or(SqlValue::Null)
        }
        data @ ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::Utc>::from_sql(&data)?
            .map(|dt| SqlValue::DateTime(dt.naive_utc()))
            .unwrap_or(SqlValue::Null),
        data @ ColumnData::Date(_) => NaiveDate::from_sql(&data)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null),
        data @ ColumnData::Time(_) => NaiveTime::from_sql(&data)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null),
        ColumnData::Xml(v) => v
            .map(|x| SqlValue::Text(x.into_owned().into_string()))
            .unwrap_or(SqlValue::Null),
    })
}
