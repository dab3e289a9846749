use serde_json::{Value, json};

/// Bumped whenever a view's field layout changes.
pub const SCHEMA_VERSION: u32 = 1;

pub const FILE_TYPE: &str = "file";
pub const FILE_TEXT_TYPE: &str = "file-text";
pub const DONOR_TEXT_TYPE: &str = "donor-text";

pub const DOC_TYPES: [&str; 3] = [FILE_TYPE, FILE_TEXT_TYPE, DONOR_TEXT_TYPE];

/// Index settings for a new generation.
pub fn settings() -> Value {
    json!({
        "settings": {
            "index": {
                "number_of_shards": 3,
                "number_of_replicas": 0,
                "max_result_window": 100000
            },
            "analysis": {
                "analyzer": {
                    "id_index": {
                        "type": "custom",
                        "tokenizer": "whitespace",
                        "filter": ["lowercase", "edge_ngram"]
                    },
                    "id_search": {
                        "type": "custom",
                        "tokenizer": "whitespace",
                        "filter": ["lowercase"]
                    }
                },
                "filter": {
                    "edge_ngram": {
                        "type": "edge_ngram",
                        "min_gram": 2,
                        "max_gram": 20
                    }
                }
            }
        },
        "mappings": {
            "_meta": { "schema_version": SCHEMA_VERSION }
        }
    })
}

/// Field layout of one document view, `None` for unknown types.
pub fn schema(doc_type: &str) -> Option<Value> {
    match doc_type {
        FILE_TYPE => Some(file_schema()),
        FILE_TEXT_TYPE => Some(text_schema(&[
            "id",
            "object_id",
            "file_name",
            "data_bundle_id",
            "donor_id",
            "project_code",
            "data_type",
        ])),
        DONOR_TEXT_TYPE => Some(with_flags(text_schema(&[
            "id",
            "project_code",
            "specimen_id",
            "sample_id",
            "submitted_donor_id",
            "submitted_specimen_id",
            "submitted_sample_id",
            "tcga_participant_barcode",
            "tcga_sample_barcode",
            "tcga_aliquot_barcode",
            "translated_id",
        ]))),
        _ => None,
    }
}

fn keyword() -> Value {
    json!({ "type": "keyword" })
}

fn text_schema(fields: &[&str]) -> Value {
    let properties = fields
        .iter()
        .map(|field| {
            (
                field.to_string(),
                json!({
                    "type": "text",
                    "analyzer": "id_index",
                    "search_analyzer": "id_search",
                    "fields": { "raw": keyword() }
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    json!({ "properties": properties })
}

fn with_flags(mut schema: Value) -> Value {
    schema["properties"]["in_harmonized_study"] = json!({ "type": "boolean" });
    schema["properties"]["registered"] = json!({ "type": "boolean" });
    schema
}

fn file_schema() -> Value {
    let index_file = json!({
        "properties": {
            "id": keyword(),
            "object_id": keyword(),
            "file_name": keyword(),
            "file_format": keyword(),
            "file_size": { "type": "long" },
            "file_md5sum": keyword()
        }
    });
    json!({
        "properties": {
            "id": keyword(),
            "object_id": keyword(),
            "study": keyword(),
            "access": keyword(),
            "data_bundle": { "properties": { "data_bundle_id": keyword() } },
            "analysis_method": {
                "properties": { "analysis_type": keyword(), "software": keyword() }
            },
            "data_categorization": {
                "properties": { "data_type": keyword(), "experimental_strategy": keyword() }
            },
            "reference_genome": {
                "properties": {
                    "genome_build": keyword(),
                    "reference_name": keyword(),
                    "download_url": { "type": "keyword", "index": false }
                }
            },
            "file_copies": {
                "type": "nested",
                "properties": {
                    "file_name": keyword(),
                    "file_format": keyword(),
                    "file_size": { "type": "long" },
                    "file_md5sum": keyword(),
                    "last_modified": { "type": "date", "format": "epoch_second" },
                    "index_file": index_file,
                    "repo_type": keyword(),
                    "repo_org": keyword(),
                    "repo_name": keyword(),
                    "repo_code": keyword(),
                    "repo_country": keyword(),
                    "repo_base_url": { "type": "keyword", "index": false },
                    "repo_data_path": { "type": "keyword", "index": false },
                    "repo_metadata_path": { "type": "keyword", "index": false }
                }
            },
            "donors": {
                "type": "nested",
                "properties": {
                    "project_code": keyword(),
                    "program": keyword(),
                    "study": keyword(),
                    "primary_site": keyword(),
                    "donor_id": keyword(),
                    "specimen_id": keyword(),
                    "specimen_type": keyword(),
                    "sample_id": keyword(),
                    "submitted_donor_id": keyword(),
                    "submitted_specimen_id": keyword(),
                    "submitted_sample_id": keyword(),
                    "other_identifiers": {
                        "properties": {
                            "tcga_participant_barcode": keyword(),
                            "tcga_sample_barcode": keyword(),
                            "tcga_aliquot_barcode": keyword()
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_view_has_a_schema() {
        for doc_type in DOC_TYPES {
            assert!(schema(doc_type).is_some(), "{doc_type}");
        }
        assert!(schema("project").is_none());
    }

    #[test]
    fn settings_carry_schema_version() {
        assert_eq!(
            settings()["mappings"]["_meta"]["schema_version"],
            SCHEMA_VERSION
        );
    }

    #[test]
    fn donor_text_has_membership_flags() {
        let donor = schema(DONOR_TEXT_TYPE).unwrap();
        assert_eq!(donor["properties"]["registered"]["type"], "boolean");
        let file = schema(FILE_TEXT_TYPE).unwrap();
        assert!(file["properties"].get("registered").is_none());
    }
}
