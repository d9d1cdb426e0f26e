//! Schema of the knowledge store, plus row writers for building stores
//! locally.
//!
//! Production artifacts are built upstream and additionally carry libSQL
//! vector indexes (`documents_embedding_idx`, `medical_qa_embedding_idx`)
//! that plain SQLite cannot create. Stores created here have none, so
//! searches against them use the full scan or the in-memory index.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

use crate::db;
use crate::embedding::vec_to_blob;
use crate::models::{Document, QaPair};

pub async fn run_migrations(path: &Path) -> Result<()> {
    let pool = db::open_writable(path).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            url TEXT,
            year INTEGER,
            specialty TEXT,
            embedding BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS medical_qa (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            document_id TEXT,
            embedding BLOB,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_specialty ON documents(specialty)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_year ON documents(year)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_medical_qa_document_id ON medical_qa(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_document(
    pool: &SqlitePool,
    doc: &Document,
    embedding: Option<&[f32]>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, title, content, url, year, specialty, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            url = excluded.url,
            year = excluded.year,
            specialty = excluded.specialty,
            embedding = excluded.embedding
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.title)
    .bind(&doc.content)
    .bind(&doc.url)
    .bind(doc.year)
    .bind(&doc.specialty)
    .bind(embedding.map(vec_to_blob))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_qa(pool: &SqlitePool, qa: &QaPair, embedding: Option<&[f32]>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO medical_qa (id, question, answer, document_id, embedding)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            question = excluded.question,
            answer = excluded.answer,
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(&qa.id)
    .bind(&qa.question)
    .bind(&qa.answer)
    .bind(&qa.document_id)
    .bind(embedding.map(vec_to_blob))
    .execute(pool)
    .await?;
    Ok(())
}
