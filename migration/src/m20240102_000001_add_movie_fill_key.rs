use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Movie::Table)
                    .add_column(string_null(Movie::FillKey))
                    .to_owned(),
            )
            .await?;

        // NULL keys never collide, so only cache-filled rows are constrained.
        manager
            .create_index(
                Index::create()
                    .name("idx_movie_fill_key_unique")
                    .table(Movie::Table)
                    .col(Movie::FillKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_movie_fill_key_unique")
                    .table(Movie::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(Table::alter().table(Movie::Table).drop_column(Movie::FillKey).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Movie {
    Table,
    FillKey,
}
