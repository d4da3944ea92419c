use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_inventory_items_table::Migration),
            Box::new(m20250301_000002_create_batches_table::Migration),
            Box::new(m20250301_000003_create_batch_audit_logs_table::Migration),
        ]
    }
}

// Migration implementations

mod m20250301_000001_create_inventory_items_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_inventory_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryItems::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(InventoryItems::StoreId).uuid().not_null())
                        .col(ColumnDef::new(InventoryItems::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(InventoryItems::Quantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryItems::MinStock)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryItems::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(InventoryItems::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryItems::UpdatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One item row per (store, product)
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_items_store_product")
                        .table(InventoryItems::Table)
                        .col(InventoryItems::StoreId)
                        .col(InventoryItems::ProductId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum InventoryItems {
        Table,
        Id,
        StoreId,
        ProductId,
        Quantity,
        MinStock,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250301_000002_create_batches_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000002_create_batches_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Batches::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Batches::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Batches::InventoryId).big_integer().not_null())
                        .col(ColumnDef::new(Batches::BatchNumber).string().not_null())
                        .col(
                            ColumnDef::new(Batches::Quantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Batches::ReceivedDate).date().not_null())
                        .col(ColumnDef::new(Batches::ManufacturingDate).date().null())
                        .col(ColumnDef::new(Batches::ExpiryDate).date().null())
                        .col(
                            ColumnDef::new(Batches::CostPerUnit)
                                .decimal()
                                .null(),
                        )
                        .col(ColumnDef::new(Batches::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Batches::UpdatedAt).timestamp().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_batches_inventory_id")
                                .from(Batches::Table, Batches::InventoryId)
                                .to(InventoryItems::Table, InventoryItems::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_batches_inventory_id")
                        .table(Batches::Table)
                        .col(Batches::InventoryId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_batches_inventory_expiry")
                        .table(Batches::Table)
                        .col(Batches::InventoryId)
                        .col(Batches::ExpiryDate)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Batches::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Batches {
        Table,
        Id,
        InventoryId,
        BatchNumber,
        Quantity,
        ReceivedDate,
        ManufacturingDate,
        ExpiryDate,
        CostPerUnit,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum InventoryItems {
        Table,
        Id,
    }
}

mod m20250301_000003_create_batch_audit_logs_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000003_create_batch_audit_logs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // No foreign key on batch_id: audit entries outlive their batch.
            manager
                .create_table(
                    Table::create()
                        .table(BatchAuditLogs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(BatchAuditLogs::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(BatchAuditLogs::BatchId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(BatchAuditLogs::UserId).uuid().null())
                        .col(
                            ColumnDef::new(BatchAuditLogs::Action)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BatchAuditLogs::QuantityBefore)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BatchAuditLogs::QuantityAfter)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(BatchAuditLogs::Details).json().null())
                        .col(
                            ColumnDef::new(BatchAuditLogs::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_batch_audit_logs_batch_created")
                        .table(BatchAuditLogs::Table)
                        .col(BatchAuditLogs::BatchId)
                        .col(BatchAuditLogs::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(BatchAuditLogs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum BatchAuditLogs {
        Table,
        Id,
        BatchId,
        UserId,
        Action,
        QuantityBefore,
        QuantityAfter,
        Details,
        CreatedAt,
    }
}

// Database migration CLI runner
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    let result = Migrator::up(&db, None).await;

    match result {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
