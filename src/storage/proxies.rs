use super::schema::Database;
use super::types::{DatabaseError, ProxyAddress};

impl Database {
    // ========================================================================
    // Proxy Operations
    // ========================================================================

    /// The oldest stored proxy, if any.
    pub async fn first_proxy(&self) -> Result<Option<ProxyAddress>, DatabaseError> {
        let proxy = sqlx::query_as::<_, ProxyAddress>(
            "SELECT id, address FROM proxies ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(proxy)
    }

    /// Store a batch of addresses in one transaction. Returns how many were stored.
    pub async fn insert_proxies(&self, addresses: &[String]) -> Result<usize, DatabaseError> {
        if addresses.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for address in addresses {
            sqlx::query("INSERT INTO proxies (address) VALUES (?)")
                .bind(address)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(addresses.len())
    }

    pub async fn delete_proxy(&self, proxy_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(proxy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every sentinel placeholder. Returns how many were removed.
    pub async fn delete_sentinel_proxies(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM proxies WHERE address = ?")
            .bind(ProxyAddress::SENTINEL)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_proxies(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
