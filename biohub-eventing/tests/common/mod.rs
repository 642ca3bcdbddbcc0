//! PostgreSQL 测试容器：整个测试二进制共享一个容器，每个测试独占一个数据库

use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedPostgres {
    _container: ContainerAsync<GenericImage>,
    host: String,
    port: u16,
}

impl SharedPostgres {
    fn url(&self, database: &str) -> String {
        format!("postgres://biohub:biohub@{}:{}/{database}", self.host, self.port)
    }
}

static POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

pub struct TestDatabase {
    pub pool: PgPool,
    name: String,
    admin_url: String,
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let name = self.name.clone();
        let admin_url = self.admin_url.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        handle.spawn(async move {
            let Ok(mut conn) = PgConnection::connect(&admin_url).await else {
                return;
            };
            let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {name} WITH (FORCE)"))
                .execute(&mut conn)
                .await;
        });
    }
}

async fn shared() -> &'static SharedPostgres {
    POSTGRES
        .get_or_init(|| async {
            let container = GenericImage::new("postgres", "16-alpine")
                .with_exposed_port(5432.tcp())
                .with_wait_for(WaitFor::message_on_stdout(
                    "database system is ready to accept connections",
                ))
                .with_env_var("POSTGRES_USER", "biohub")
                .with_env_var("POSTGRES_PASSWORD", "biohub")
                .with_env_var("POSTGRES_DB", "biohub")
                .with_startup_timeout(Duration::from_secs(60))
                .start()
                .await
                .expect("failed to start postgres container");

            // 初始化阶段也会打印一次就绪日志
            tokio::time::sleep(Duration::from_secs(1)).await;

            let host = container
                .get_host()
                .await
                .expect("failed to get container host")
                .to_string();
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            SharedPostgres {
                _container: container,
                host,
                port,
            }
        })
        .await
}

/// 新建一个空数据库并返回其连接池
pub async fn database() -> TestDatabase {
    let pg = shared().await;
    let admin_url = pg.url("biohub");
    let name = format!("bus_{}", Uuid::new_v4().simple());

    let mut conn = PgConnection::connect(&admin_url)
        .await
        .expect("failed to connect to admin database");
    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&mut conn)
        .await
        .expect("failed to create test database");

    let pool = PgPool::connect(&pg.url(&name))
        .await
        .expect("failed to connect to test database");

    TestDatabase {
        pool,
        name,
        admin_url,
    }
}
