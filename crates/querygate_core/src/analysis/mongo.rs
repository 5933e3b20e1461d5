//! MongoDB analyzer.
//!
//! Works over shell syntax (`db.<collection>.<method>(...)`, one statement per
//! line or `;`) and over raw command documents (`{ delete: "users", ... }`).
//! Method names are looked up in `MONGO_PATTERNS`; server-side JavaScript and
//! collection-overwriting aggregation stages are flagged wherever they appear.

use std::sync::LazyLock;

use serde_json::Value;

use super::patterns::{strongest, OperationPattern};
use super::report::AnalysisBuilder;
use super::{contain_statement, QueryAnalyzer};
use crate::models::{
    AnalysisWarning, DatabaseType, OperationType, Priority, QueryAnalysis, RiskLevel, WarningLevel,
};
use crate::mongo_shell::{
    mask_js, method_calls, parse_relaxed_json, split_statements, unterminated,
    ShellStatement,
};

use OperationType::{Admin, Ddl, Dml, Read};
use RiskLevel::{Critical, High, Low, Medium, Safe};

static MONGO_PATTERNS: LazyLock<Vec<OperationPattern>> = LazyLock::new(|| {
    vec![
        OperationPattern::method("DROP_DATABASE", &["dropDatabase"], Ddl, Critical)
            .describe("Drops the database", "database", Some(false), "All collections and documents are deleted"),
        OperationPattern::method("DROP_COLLECTION", &["drop"], Ddl, Critical)
            .describe("Drops a collection", "collection", Some(false), "The collection, its documents and indexes are deleted"),
        OperationPattern::method("DELETE_MANY", &["deleteMany", "remove"], Dml, Critical)
            .bounded(High)
            .describe("Deletes documents", "documents matching filter", Some(false), "Matching documents are deleted"),
        OperationPattern::method("DELETE_ONE", &["deleteOne"], Dml, Medium)
            .bounded(Medium)
            .describe("Deletes one document", "single document", Some(false), "The first matching document is deleted"),
        OperationPattern::method("UPDATE_MANY", &["updateMany"], Dml, High)
            .bounded(Medium)
            .describe("Updates documents", "documents matching filter", Some(false), "Matching documents are modified"),
        OperationPattern::method("UPDATE_ONE", &["updateOne", "update"], Dml, Medium)
            .bounded(Low)
            .describe("Updates one document", "single document", Some(false), "The first matching document is modified"),
        OperationPattern::method("REPLACE_ONE", &["replaceOne"], Dml, Medium)
            .bounded(Medium)
            .describe("Replaces one document", "single document", Some(false), "The document body is overwritten"),
        OperationPattern::method(
            "FIND_AND_MODIFY",
            &["findOneAndDelete", "findOneAndUpdate", "findOneAndReplace", "findAndModify"],
            Dml,
            Medium,
        )
        .bounded(Medium)
        .describe("Modifies one document and returns it", "single document", Some(false), "The matching document is changed"),
        OperationPattern::method("BULK_WRITE", &["bulkWrite"], Dml, High)
            .describe("Runs a batch of writes", "collection", Some(false), "Multiple inserts, updates or deletes"),
        OperationPattern::method("RENAME_COLLECTION", &["renameCollection"], Ddl, High)
            .describe("Renames a collection", "collection", Some(true), "Clients using the old name fail"),
        OperationPattern::method("CREATE_INDEX", &["createIndex", "createIndexes", "ensureIndex"], Ddl, Medium)
            .describe("Builds an index", "collection", Some(true), "Index build consumes resources"),
        OperationPattern::method("DROP_INDEX", &["dropIndex"], Ddl, Medium)
            .describe("Drops an index", "index", Some(true), "Queries relying on the index slow down"),
        OperationPattern::method("DROP_INDEXES", &["dropIndexes"], Ddl, Medium)
            .describe("Drops indexes", "collection", Some(true), "All non-_id indexes may be removed"),
        OperationPattern::method("RUN_COMMAND", &["runCommand", "adminCommand"], Admin, High)
            .describe("Runs a raw database command", "database", None, "Effect depends on the command"),
        OperationPattern::method("CREATE_COLLECTION", &["createCollection"], Ddl, Low)
            .describe("Creates a collection", "collection", Some(true), "A new collection exists"),
        OperationPattern::method("INSERT_ONE", &["insertOne", "insert"], Dml, Low)
            .describe("Inserts a document", "single document", Some(true), "A new document is added"),
        OperationPattern::method("INSERT_MANY", &["insertMany"], Dml, Low)
            .describe("Inserts documents", "documents", Some(true), "New documents are added"),
        OperationPattern::method("GET_SIBLING_DB", &["getSiblingDB"], Admin, Low)
            .describe("Switches to another database", "database", None, "Following calls target another database"),
        OperationPattern::method("FIND", &["find", "findOne"], Read, Safe)
            .describe("Reads documents", "documents", None, "No data is modified"),
        OperationPattern::method("AGGREGATE", &["aggregate"], Read, Safe)
            .describe("Runs an aggregation pipeline", "documents", None, "No data is modified"),
        OperationPattern::method(
            "COUNT",
            &["countDocuments", "count", "estimatedDocumentCount", "distinct"],
            Read,
            Safe,
        )
        .describe("Counts documents", "documents", None, "No data is modified"),
    ]
});

/// Stage and operator patterns that apply regardless of the method called.
static MONGO_OPERATOR_PATTERNS: LazyLock<Vec<OperationPattern>> = LazyLock::new(|| {
    vec![
        OperationPattern::regex("WHERE_JS", r"\$(?:where|function|accumulator)\b", Admin, High)
            .describe("Runs JavaScript on the server", "server", None, "Arbitrary code executes inside the database"),
        OperationPattern::regex("AGGREGATE_OUT", r"\$(?:out|merge)\b", Dml, High)
            .describe("Writes aggregation results to a collection", "collection", Some(false), "Target collection is replaced or merged"),
    ]
});

/// Pattern-based MongoDB analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoAnalyzer;

impl QueryAnalyzer for MongoAnalyzer {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mongodb
    }

    fn analyze(&self, query: &str) -> QueryAnalysis {
        if query.trim().is_empty() {
            return QueryAnalysis::degraded(DatabaseType::Mongodb, "Query is empty");
        }

        let mut builder = AnalysisBuilder::new(DatabaseType::Mongodb);
        for statement in split_statements(query) {
            contain_statement(&mut builder, statement.line, |builder| analyze_statement(builder, &statement));
        }

        if let Some(open) = unterminated(query) {
            builder.warn(
                AnalysisWarning::new(WarningLevel::Warning, format!("Unterminated {open} at end of input"))
                    .with_suggestion("Check quoting; calls after this point may be misclassified"),
            );
        }

        builder.finish()
    }
}

fn analyze_statement(builder: &mut AnalysisBuilder, statement: &ShellStatement) {
    builder.begin_statement(statement.line, &statement.text);
    let before = builder.current_risk();
    let mut recognized = false;

    if statement.text.starts_with('{') {
        recognized |= analyze_command_document(builder, statement);
    } else {
        for call in method_calls(&statement.text) {
            let Some(pattern) = MONGO_PATTERNS.iter().find(|p| p.matches_method(&call.name)) else {
                continue;
            };
            let line = statement.line + statement.text[..call.offset].matches('\n').count();
            let bounded = pattern.is_boundable() && !call.has_empty_filter();
            record_method(builder, pattern, bounded, line, &call.name);
            recognized = true;
        }
    }

    let keys = operator_keys(&statement.text);
    for pattern in MONGO_OPERATOR_PATTERNS.iter() {
        if pattern.find_regex(&keys).is_none() {
            continue;
        }
        recognized = true;
        builder.record(pattern.to_operation(false, statement.line));
        if pattern.operation == "WHERE_JS" {
            builder.warn(
                AnalysisWarning::new(
                    WarningLevel::Critical,
                    "Server-side JavaScript ($where/$function) executes arbitrary code",
                )
                .with_suggestion("Rewrite the filter with query operators")
                .at_line(statement.line),
            );
        } else {
            builder.warn(
                AnalysisWarning::new(
                    WarningLevel::Warning,
                    "$out/$merge stage writes into a collection and may overwrite it",
                )
                .with_suggestion("Confirm the target collection name")
                .at_line(statement.line),
            );
        }
    }

    if !recognized {
        builder.warn(
            AnalysisWarning::new(WarningLevel::Info, "Unrecognized statement")
                .with_suggestion("Review this statement manually")
                .at_line(statement.line),
        );
    }

    if builder.current_risk() >= Critical && before < Critical {
        builder.recommend(
            Priority::High,
            "Export the affected collection with mongodump before executing",
            "Dropped or emptied collections cannot be recovered without a backup",
        );
    }
}

fn record_method(
    builder: &mut AnalysisBuilder,
    pattern: &OperationPattern,
    bounded: bool,
    line: usize,
    method: &str,
) {
    let mut op = pattern.to_operation(bounded, line);
    if pattern.is_boundable() && !bounded {
        op.impact.scope = "all documents".to_string();
        builder.warn(
            AnalysisWarning::new(
                WarningLevel::Critical,
                format!("{method} called with an empty filter matches every document"),
            )
            .with_suggestion("Pass a filter that matches only the intended documents")
            .at_line(line),
        );
        builder.recommend(
            Priority::High,
            "Add a filter to destructive MongoDB operations",
            "An empty filter applies the operation to the whole collection",
        );
    }
    builder.record(op);
}

/// Masked statement with object-key strings restored, so `"$where": ...`
/// still matches while `"uses $where"` as a value does not.
fn operator_keys(text: &str) -> String {
    let masked = mask_js(text);
    let bytes = masked.as_bytes();
    let mut out = masked.clone();
    let mut i = 0usize;
    while i < bytes.len() {
        let quote = bytes[i];
        if !matches!(quote, b'"' | b'\'' | b'`') {
            i += 1;
            continue;
        }
        let Some(close) = bytes[i + 1..].iter().position(|&b| b == quote).map(|n| i + 1 + n) else {
            break;
        };
        if masked[close + 1..].trim_start().starts_with(':') {
            out.replace_range(i + 1..close, &text[i + 1..close]);
        }
        i = close + 1;
    }
    out
}

/// Classify a raw command document such as `{ delete: "users", deletes: [...] }`.
fn analyze_command_document(builder: &mut AnalysisBuilder, statement: &ShellStatement) -> bool {
    let Ok(Value::Object(document)) = parse_relaxed_json(&statement.text) else {
        builder.warn(
            AnalysisWarning::new(WarningLevel::Warning, "Command document could not be parsed")
                .with_suggestion("Review this statement manually")
                .at_line(statement.line),
        );
        return false;
    };
    let Some((command, _)) = document.iter().next() else {
        return false;
    };

    let first = |key: &str| document.get(key).and_then(Value::as_array).and_then(|a| a.first());
    let filter_is_empty = |entry: Option<&Value>, key: &str| match entry.and_then(|e| e.get(key)) {
        None => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    };

    let (method, bounded) = match command.as_str() {
        "delete" => {
            let entry = first("deletes");
            let single = entry.and_then(|e| e.get("limit")).and_then(Value::as_i64) == Some(1);
            let method = if single { "deleteOne" } else { "deleteMany" };
            (method, !filter_is_empty(entry, "q"))
        }
        "update" => {
            let entry = first("updates");
            let multi = entry.and_then(|e| e.get("multi")).and_then(Value::as_bool) == Some(true);
            let method = if multi { "updateMany" } else { "updateOne" };
            (method, !filter_is_empty(entry, "q"))
        }
        "findAndModify" | "findandmodify" => (
            "findAndModify",
            matches!(document.get("query"), Some(Value::Object(query)) if !query.is_empty()),
        ),
        "drop" => ("drop", false),
        "dropDatabase" => ("dropDatabase", false),
        "insert" => ("insertMany", false),
        "find" => ("find", false),
        "aggregate" => ("aggregate", false),
        "count" => ("count", false),
        "distinct" => ("distinct", false),
        "createIndexes" => ("createIndexes", false),
        "dropIndexes" => ("dropIndexes", false),
        "renameCollection" => ("renameCollection", false),
        "create" => ("createCollection", false),
        _ => ("runCommand", false),
    };

    let candidates = MONGO_PATTERNS
        .iter()
        .filter(|p| p.matches_method(method))
        .map(|p| (p, p.is_boundable() && bounded));
    match strongest(candidates) {
        Some((pattern, bounded)) => {
            record_method(builder, pattern, bounded, statement.line, command);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(query: &str) -> QueryAnalysis {
        MongoAnalyzer.analyze(query)
    }

    #[test]
    fn test_delete_many_empty_filter_is_critical() {
        let analysis = analyze("db.users.deleteMany({})");
        assert_eq!(analysis.overall_risk, Critical);
        assert_eq!(analysis.operations[0].operation, "DELETE_MANY");
        assert_eq!(analysis.operations[0].impact.scope, "all documents");
        assert!(analysis.warnings.iter().any(|w| w.message.contains("empty filter")));
    }

    #[test]
    fn test_find_is_safe() {
        let analysis = analyze("db.users.find({active:true})");
        assert_eq!(analysis.overall_risk, Safe);
        assert_eq!(analysis.operations[0].operation, "FIND");
        assert!(analysis.warnings.is_empty());
    }

    #[test]
    fn test_filter_lowers_risk() {
        assert_eq!(analyze("db.users.deleteMany({status: 'inactive'})").overall_risk, High);
        assert_eq!(analyze("db.users.remove()").overall_risk, Critical);
        assert_eq!(analyze("db.users.updateMany({}, {$set: {a: 1}})").overall_risk, High);
        assert_eq!(analyze("db.users.updateMany({a: 0}, {$set: {a: 1}})").overall_risk, Medium);
        assert_eq!(analyze("db.users.updateOne({_id: 1}, {$set: {a: 1}})").overall_risk, Low);
        assert_eq!(analyze("db.users.updateOne({}, {$set: {a: 1}})").overall_risk, Medium);
    }

    #[test]
    fn test_delete_one_with_empty_filter_warns() {
        let analysis = analyze("db.users.deleteOne({})");
        assert_eq!(analysis.overall_risk, Medium);
        assert!(analysis.warnings.iter().any(|w| w.message.contains("empty filter")));
    }

    #[test]
    fn test_drop_and_drop_database_are_critical() {
        assert_eq!(analyze("db.users.drop()").operations[0].operation, "DROP_COLLECTION");
        assert_eq!(analyze("db.dropDatabase()").operations[0].operation, "DROP_DATABASE");
        let analysis = analyze("db.getSiblingDB('archive').dropDatabase()");
        assert!(analysis.has_operation("GET_SIBLING_DB"));
        assert_eq!(analysis.overall_risk, Critical);
    }

    #[test]
    fn test_where_js_flagged_regardless_of_method() {
        let analysis = analyze("db.users.find({$where: 'this.a > this.b'})");
        assert_eq!(analysis.overall_risk, High);
        assert!(analysis.has_operation("WHERE_JS"));
        assert!(analysis.has_operation("FIND"));

        let analysis = analyze(r#"db.users.find({"$where": "sleep(1000)"})"#);
        assert!(analysis.has_operation("WHERE_JS"));

        let analysis = analyze("db.notes.find({text: 'uses $where in prose'})");
        assert!(!analysis.has_operation("WHERE_JS"));
    }

    #[test]
    fn test_aggregate_out_stage() {
        let analysis = analyze("db.orders.aggregate([{$match: {a: 1}}, {$out: 'summary'}])");
        assert!(analysis.has_operation("AGGREGATE_OUT"));
        assert_eq!(analysis.overall_risk, High);
    }

    #[test]
    fn test_other_methods() {
        assert_eq!(analyze("db.a.insertOne({x: 1})").overall_risk, Low);
        assert_eq!(analyze("db.a.insertMany([{x: 1}])").overall_risk, Low);
        assert_eq!(analyze("db.a.createIndex({x: 1})").overall_risk, Medium);
        assert_eq!(analyze("db.a.dropIndex('x_1')").overall_risk, Medium);
        assert_eq!(analyze("db.a.bulkWrite([])").overall_risk, High);
        assert_eq!(analyze("db.a.renameCollection('b')").overall_risk, High);
        assert_eq!(analyze("db.runCommand({ping: 1})").operations[0].op_type, Admin);
        assert_eq!(analyze("db.a.countDocuments()").overall_risk, Safe);
        assert_eq!(analyze("db.a.findOneAndDelete({x: 1})").overall_risk, Medium);
    }

    #[test]
    fn test_method_names_inside_strings_are_ignored() {
        let analysis = analyze("db.logs.find({msg: 'db.users.drop()'})");
        assert_eq!(analysis.overall_risk, Safe);
    }

    #[test]
    fn test_multiple_statements() {
        let analysis = analyze("db.a.find()\ndb.b.deleteMany({})\ndb.c.deleteMany({x: 1});");
        assert!(analysis.is_multi_statement);
        assert_eq!(analysis.statement_count, 3);
        let delete = analysis.operation("DELETE_MANY").unwrap();
        assert_eq!(delete.count, Some(2));
        assert_eq!(delete.risk, Critical);
        assert_eq!(delete.line_numbers, Some(vec![2, 3]));
        assert_eq!(analysis.operation_counts.as_ref().unwrap()["FIND"], 1);
    }

    #[test]
    fn test_command_documents() {
        let analysis = analyze(r#"{ "delete": "users", "deletes": [ { "q": {}, "limit": 0 } ] }"#);
        assert_eq!(analysis.operations[0].operation, "DELETE_MANY");
        assert_eq!(analysis.overall_risk, Critical);

        let analysis = analyze(r#"{ delete: "users", deletes: [ { q: { _id: 1 }, limit: 1 } ] }"#);
        assert_eq!(analysis.operations[0].operation, "DELETE_ONE");
        assert_eq!(analysis.overall_risk, Medium);

        let analysis = analyze(r#"{ "drop": "users" }"#);
        assert_eq!(analysis.overall_risk, Critical);

        let analysis = analyze(r#"{ "serverStatus": 1 }"#);
        assert_eq!(analysis.operations[0].operation, "RUN_COMMAND");
    }

    #[test]
    fn test_unparseable_input_degrades() {
        let analysis = analyze("show collections");
        assert!(analysis.operations.is_empty());
        assert_eq!(analysis.overall_risk, Safe);
        assert!(!analysis.warnings.is_empty());

        let analysis = analyze("db.users.find({name: 'abc");
        assert!(analysis.warnings.iter().any(|w| w.message.contains("Unterminated")));

        assert_eq!(analyze("").warnings.len(), 1);
    }
}
