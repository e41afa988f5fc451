//! User profiles and daily exchange rates, so that currencies and limits
//! survive restarts along with the ledger.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(Iden)]
enum Users {
    Table,
    Id,
    Currency,
    MonthlyLimit,
}

#[derive(Iden)]
enum ExchangeRates {
    Table,
    Currency,
    Date,
    Rate,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Currency).string_len(3).not_null())
                    .col(ColumnDef::new(Users::MonthlyLimit).string())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ExchangeRates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExchangeRates::Currency)
                            .string_len(3)
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExchangeRates::Date).date().not_null())
                    .col(ColumnDef::new(ExchangeRates::Rate).string().not_null())
                    .primary_key(
                        Index::create()
                            .col(ExchangeRates::Currency)
                            .col(ExchangeRates::Date),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExchangeRates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}
