use pgrx::prelude::*;

// Extension-owned tables, created with the extension
extension_sql!(
    r"
    CREATE TABLE IF NOT EXISTS public.denorm_dirty_instance (
        id BIGSERIAL PRIMARY KEY,
        content_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        old_object_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE UNIQUE INDEX IF NOT EXISTS denorm_dirty_instance_dedup
        ON public.denorm_dirty_instance (content_type, object_id, COALESCE(old_object_id, ''));

    CREATE TABLE IF NOT EXISTS public.denorm_dependency (
        id BIGSERIAL PRIMARY KEY,
        owner_table TEXT NOT NULL,
        source_table TEXT NOT NULL,
        foreign_key TEXT,
        skip TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE UNIQUE INDEX IF NOT EXISTS denorm_dependency_unique
        ON public.denorm_dependency (owner_table, source_table, COALESCE(foreign_key, ''));

    CREATE TABLE IF NOT EXISTS public.denorm_audit_log (
        id BIGSERIAL PRIMARY KEY,
        operation TEXT NOT NULL,
        performed_by TEXT NOT NULL,
        details JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    COMMENT ON TABLE public.denorm_dirty_instance IS 'Rows whose denormalized values must be recomputed';
    COMMENT ON TABLE public.denorm_dependency IS 'Declared dependencies between tables';
    COMMENT ON TABLE public.denorm_audit_log IS 'One row per trigger reconciliation run';
    ",
    name = "create_denorm_tables",
);

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_metadata_tables_exist() {
        let exists = Spi::get_one::<bool>(
            "SELECT COUNT(*) = 3 FROM information_schema.tables
             WHERE table_schema = 'public'
               AND table_name IN ('denorm_dirty_instance', 'denorm_dependency', 'denorm_audit_log')",
        )
        .unwrap();
        assert_eq!(exists, Some(true));
    }

    #[pg_test]
    fn test_dirty_queue_schema() {
        let columns = Spi::connect(|client| {
            let mut columns = Vec::new();
            let query = "
                SELECT column_name::text, data_type::text, is_nullable::text
                FROM information_schema.columns
                WHERE table_name = 'denorm_dirty_instance' AND table_schema = 'public'
                ORDER BY ordinal_position
            ";

            for row in client.select(query, None, None)? {
                let name: String = row.get(1)?.unwrap_or_default();
                let data_type: String = row.get(2)?.unwrap_or_default();
                let nullable: String = row.get(3)?.unwrap_or_default();
                columns.push((name, data_type, nullable));
            }

            Ok::<_, pgrx::spi::SpiError>(columns)
        })
        .expect("Failed to query column info");

        let expected = vec![
            ("id", "bigint", "NO"),
            ("content_type", "text", "NO"),
            ("object_id", "text", "NO"),
            ("old_object_id", "text", "YES"),
            ("created_at", "timestamp with time zone", "NO"),
        ];

        for (name, data_type, nullable) in expected {
            assert!(
                columns.iter().any(|(n, t, o)| n == name && t == data_type && o == nullable),
                "Column {} {} nullable={} not found in {:?}",
                name,
                data_type,
                nullable,
                columns
            );
        }
    }

    #[pg_test]
    fn test_dirty_queue_dedups_pending_rows() {
        Spi::run(
            "INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id)
             VALUES ('public.post', '1', NULL), ('public.post', '1', NULL), ('public.post', '1', '2')
             ON CONFLICT DO NOTHING",
        )
        .unwrap();

        let count = Spi::get_one::<i64>("SELECT count(*) FROM public.denorm_dirty_instance").unwrap();
        assert_eq!(count, Some(2));
    }
}
