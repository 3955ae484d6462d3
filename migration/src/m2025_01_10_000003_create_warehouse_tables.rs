//! Migration to create the warehouse destination tables.
//!
//! Every entity of the built-in table sync policy gets a destination table whose
//! primary key is the entity's declared key column set. The upsert path relies on
//! that key as its conflict target.

use sea_orm_migration::prelude::*;

#[derive(Clone, Copy)]
enum Kind {
    Id,
    Text,
    Flag,
    Amount,
    Date,
    Timestamp,
}

struct WarehouseTable {
    name: &'static str,
    keys: &'static [&'static str],
    columns: &'static [(&'static str, Kind)],
}

const TABLES: &[WarehouseTable] = &[
    WarehouseTable {
        name: "organizations",
        keys: &["org_id"],
        columns: &[
            ("org_id", Kind::Id),
            ("value", Kind::Text),
            ("name", Kind::Text),
            ("is_active", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "product_categories",
        keys: &["category_id"],
        columns: &[
            ("category_id", Kind::Id),
            ("value", Kind::Text),
            ("name", Kind::Text),
            ("is_active", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "price_lists",
        keys: &["price_list_id"],
        columns: &[
            ("price_list_id", Kind::Id),
            ("name", Kind::Text),
            ("currency", Kind::Text),
            ("is_active", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "products",
        keys: &["product_id"],
        columns: &[
            ("product_id", Kind::Id),
            ("value", Kind::Text),
            ("name", Kind::Text),
            ("category_id", Kind::Id),
            ("uom", Kind::Text),
            ("is_active", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "locations",
        keys: &["location_id"],
        columns: &[
            ("location_id", Kind::Id),
            ("org_id", Kind::Id),
            ("value", Kind::Text),
            ("name", Kind::Text),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "business_partners",
        keys: &["partner_id"],
        columns: &[
            ("partner_id", Kind::Id),
            ("value", Kind::Text),
            ("name", Kind::Text),
            ("is_customer", Kind::Flag),
            ("is_active", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "product_prices",
        keys: &["price_list_id", "product_id"],
        columns: &[
            ("price_list_id", Kind::Id),
            ("product_id", Kind::Id),
            ("list_price", Kind::Amount),
            ("standard_price", Kind::Amount),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "invoices",
        keys: &["invoice_id"],
        columns: &[
            ("invoice_id", Kind::Id),
            ("org_id", Kind::Id),
            ("partner_id", Kind::Id),
            ("document_no", Kind::Text),
            ("date_invoiced", Kind::Date),
            ("grand_total", Kind::Amount),
            ("doc_status", Kind::Text),
            ("is_sales", Kind::Flag),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "invoice_lines",
        keys: &["invoice_line_id"],
        columns: &[
            ("invoice_line_id", Kind::Id),
            ("invoice_id", Kind::Id),
            ("product_id", Kind::Id),
            ("qty_invoiced", Kind::Amount),
            ("line_net_amt", Kind::Amount),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "orders",
        keys: &["order_id"],
        columns: &[
            ("order_id", Kind::Id),
            ("org_id", Kind::Id),
            ("partner_id", Kind::Id),
            ("document_no", Kind::Text),
            ("date_ordered", Kind::Date),
            ("grand_total", Kind::Amount),
            ("doc_status", Kind::Text),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "order_lines",
        keys: &["order_line_id"],
        columns: &[
            ("order_line_id", Kind::Id),
            ("order_id", Kind::Id),
            ("product_id", Kind::Id),
            ("qty_ordered", Kind::Amount),
            ("line_net_amt", Kind::Amount),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "inventory",
        keys: &["product_id", "location_id"],
        columns: &[
            ("product_id", Kind::Id),
            ("location_id", Kind::Id),
            ("qty_on_hand", Kind::Amount),
            ("qty_reserved", Kind::Amount),
            ("updated", Kind::Timestamp),
        ],
    },
    WarehouseTable {
        name: "allocations",
        keys: &["allocation_line_id"],
        columns: &[
            ("allocation_line_id", Kind::Id),
            ("invoice_id", Kind::Id),
            ("partner_id", Kind::Id),
            ("amount", Kind::Amount),
            ("date_trx", Kind::Date),
            ("created", Kind::Timestamp),
            ("updated", Kind::Timestamp),
        ],
    },
];

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in TABLES {
            manager.create_table(table.definition()).await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in TABLES.iter().rev() {
            manager
                .drop_table(Table::drop().table(Alias::new(table.name)).to_owned())
                .await?;
        }
        Ok(())
    }
}

impl WarehouseTable {
    fn definition(&self) -> TableCreateStatement {
        let mut create = Table::create();
        create.table(Alias::new(self.name)).if_not_exists();

        for (name, kind) in self.columns {
            let mut column = ColumnDef::new(Alias::new(*name));
            match kind {
                Kind::Id => column.big_integer(),
                Kind::Text => column.text(),
                Kind::Flag => column.string_len(1),
                Kind::Amount => column.decimal_len(16, 4),
                Kind::Date => column.date(),
                Kind::Timestamp => column.timestamp_with_time_zone(),
            };
            if self.keys.contains(name) {
                column.not_null();
            } else {
                column.null();
            }
            create.col(&mut column);
        }

        let mut primary = Index::create();
        primary.name(format!("pk_{}", self.name));
        for key in self.keys {
            primary.col(Alias::new(*key));
        }
        create.primary_key(&mut primary);

        create.to_owned()
    }
}
