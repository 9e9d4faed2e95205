use super::mongo_restore::{bson_helper, Namespace};
use super::target::{BatchOutcome, RestoreTarget, WriteFailure, WriteOptions};
use crate::error::{RestoreError, Result};
use crate::ADMIN_DB_NAME;
use bson::document::ValueAccessError;
use bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use mongodb::sync::{Client, Database};
use tracing::debug;
use uuid::Uuid;

/// A simple abstraction for the mongodb we restore into.
///
/// Cloning a connection is cheap, clones share the same underlying connection pool, so every
/// worker thread can own one.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: ConnectionInner,
}

impl Connection {
    /// create a new connection to mongodb at `uri`.
    pub fn new(uri: &str) -> Result<Connection> {
        let target_conn = Client::with_uri_str(uri)?;
        Ok(Connection {
            inner: ConnectionInner {
                target_conn,
                uri: uri.to_string(),
            },
        })
    }

    /// Check if we have enough permissions to run restore progress.
    pub fn check_permissions(&self) -> Result<()> {
        self.inner.check_permissions()
    }

    fn database(&self, name: &str) -> Database {
        self.inner.target_conn.database(name)
    }

    /// return admin database, which runs `applyOps` and auth commands.
    fn get_target_admin_db(&self) -> Database {
        self.database(ADMIN_DB_NAME)
    }
}

#[derive(Clone, Debug)]
struct ConnectionInner {
    target_conn: Client,
    uri: String,
}

impl ConnectionInner {
    pub fn check_permissions(&self) -> Result<()> {
        let admin_db = self.target_conn.database(ADMIN_DB_NAME);
        if let Err(e) = admin_db.run_command(doc! {"ping": 1}, None) {
            return Err(RestoreError::PermissionError {
                uri: self.uri.clone(),
                db: ADMIN_DB_NAME.to_string(),
                detail: e,
            });
        }
        Ok(())
    }
}

impl RestoreTarget for Connection {
    fn collection_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self.database(db).list_collection_names(None)?)
    }

    fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        self.database(&ns.db)
            .collection::<Document>(&ns.coll)
            .drop(None)
            .map_err(|source| RestoreError::CollectionSetup { op: "drop", source })
    }

    fn create_collection(&self, ns: &Namespace, options: Document, uuid: Option<Uuid>) -> Result<()> {
        let mut create_cmd = doc! {"create": ns.coll.as_str()};
        for (key, value) in options {
            create_cmd.insert(key, value);
        }

        let result = match uuid {
            None => self.database(&ns.db).run_command(create_cmd, None),
            // the `create` command can't take a uuid, but a `c` oplog entry can.
            Some(uuid) => self.get_target_admin_db().run_command(
                doc! {
                    "applyOps": [{
                        "op": "c",
                        "ns": format!("{}.$cmd", ns.db),
                        "ui": bson_helper::new_binary(uuid),
                        "o": create_cmd,
                    }]
                },
                None,
            ),
        };
        result
            .map(|_| ())
            .map_err(|source| RestoreError::CollectionSetup {
                op: "create",
                source,
            })
    }

    fn insert_documents(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<BatchOutcome> {
        // the driver's insert_many stops reporting at the first error batch, so we build the
        // insert command ourselves and read every write error from the reply.
        let mut insert_cmd = doc! {
            "insert": ns.coll.as_str(),
            "documents": docs,
            "ordered": options.ordered,
        };
        if options.bypass_document_validation {
            insert_cmd.insert("bypassDocumentValidation", true);
        }
        if let Some(write_concern) = &options.write_concern {
            insert_cmd.insert("writeConcern", write_concern.clone());
        }

        let reply = self.database(&ns.db).run_command(insert_cmd, None)?;
        parse_insert_reply(&reply)
    }

    fn create_indexes(&self, ns: &Namespace, indexes: Vec<Document>) -> Result<()> {
        self.database(&ns.db)
            .run_command(
                doc! {
                    "createIndexes": ns.coll.as_str(),
                    "indexes": indexes,
                },
                None,
            )
            .map(|_| ())
            .map_err(|source| RestoreError::CollectionSetup {
                op: "create indexes on",
                source,
            })
    }

    fn apply_ops(&self, entries: Vec<Document>) -> Result<()> {
        let reply = self
            .get_target_admin_db()
            .run_command(doc! {"applyOps": entries}, None)
            .map_err(apply_ops_error)?;
        check_apply_ops_reply(reply)
    }

    fn auth_schema_version(&self) -> Result<Option<i32>> {
        let version_doc = self
            .get_target_admin_db()
            .collection::<Document>("system.version")
            .find_one(doc! {"_id": "authSchema"}, None)?;
        match version_doc {
            None => Ok(None),
            Some(d) => Ok(Some(bson_helper::get_number(&d, "currentVersion")? as i32)),
        }
    }

    fn merge_auth_collections(
        &self,
        temp_users: Option<&Namespace>,
        temp_roles: Option<&Namespace>,
        drop: bool,
        db: Option<&str>,
    ) -> Result<()> {
        let mut merge_cmd = doc! {
            "_mergeAuthzCollections": 1,
            "drop": drop,
            "db": db.unwrap_or(""),
        };
        if let Some(users) = temp_users {
            merge_cmd.insert("tempUsersCollection", users.to_string());
        }
        if let Some(roles) = temp_roles {
            merge_cmd.insert("tempRolesCollection", roles.to_string());
        }
        debug!(?merge_cmd, "Merge auth collections.");
        self.get_target_admin_db().run_command(merge_cmd, None)?;
        Ok(())
    }
}

/// Read inserted count and write errors from an `insert` command reply.
fn parse_insert_reply(reply: &Document) -> Result<BatchOutcome> {
    if let Ok(wc_error) = reply.get_document("writeConcernError") {
        return Err(RestoreError::WriteConcernError {
            code: wc_error.get_i32("code").unwrap_or(0),
            message: wc_error.get_str("errmsg").unwrap_or_default().to_string(),
        });
    }

    let inserted = bson_helper::get_number(reply, "n")? as u64;
    let mut failures = vec![];
    if let Ok(write_errors) = reply.get_array("writeErrors") {
        for error in write_errors {
            let error = match error {
                Bson::Document(d) => d,
                _ => return Err(RestoreError::BsonError(ValueAccessError::UnexpectedType)),
            };
            failures.push(WriteFailure {
                index: bson_helper::get_number(error, "index")? as usize,
                code: error.get_i32("code").unwrap_or(0),
                message: error.get_str("errmsg").unwrap_or_default().to_string(),
            });
        }
    }
    Ok(BatchOutcome { inserted, failures })
}

fn apply_ops_error(error: MongoError) -> RestoreError {
    match error.kind.as_ref() {
        MongoErrorKind::Command(err) => RestoreError::ApplyOplogError(doc! {
            "ok": 0,
            "code": err.code,
            "codeName": err.code_name.as_str(),
            "errmsg": err.message.as_str(),
        }),
        _ => RestoreError::MongoError(error),
    }
}

/// `applyOps` can answer ok with some operations reported as failed in `results`.
fn check_apply_ops_reply(reply: Document) -> Result<()> {
    let ok = bson_helper::get_number(&reply, "ok").unwrap_or(0.0);
    let all_applied = match reply.get_array("results") {
        Ok(results) => results.iter().all(|r| r.as_bool().unwrap_or(true)),
        Err(_) => true,
    };
    if ok == 1.0 && all_applied {
        Ok(())
    } else {
        Err(RestoreError::ApplyOplogError(reply))
    }
}
