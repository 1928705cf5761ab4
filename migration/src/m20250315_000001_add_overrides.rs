use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Direct per-subject grants and denials
        manager
            .create_table(
                Table::create()
                    .table(SubjectPermissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubjectPermissions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SubjectPermissions::Subject)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubjectPermissions::PermissionId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SubjectPermissions::Effect)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SubjectPermissions::ValidFrom).big_integer())
                    .col(ColumnDef::new(SubjectPermissions::ValidUntil).big_integer())
                    .col(
                        ColumnDef::new(SubjectPermissions::IsActive)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_subject_permissions_subject")
                    .table(SubjectPermissions::Table)
                    .col(SubjectPermissions::Subject)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SubjectPermissions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SubjectPermissions {
    Table,
    Id,
    Subject,
    PermissionId,
    Effect,
    ValidFrom,
    ValidUntil,
    IsActive,
}
