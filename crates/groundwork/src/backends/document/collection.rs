//! Collection access bound to a handle's session

use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::ClientSession;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DriverResult;

pub use mongodb::results::UpdateResult;

/// A named collection. Operations run inside the handle's transaction when
/// it has one.
pub struct Collection<'h> {
    inner: mongodb::Collection<Document>,
    session: Option<&'h mut ClientSession>,
}

impl<'h> Collection<'h> {
    pub(super) fn new(inner: mongodb::Collection<Document>, session: Option<&'h mut ClientSession>) -> Self {
        Self { inner, session }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Insert one document; the server assigns an `ObjectId` when `_id` is
    /// absent. Returns the document's `_id`.
    pub async fn insert_one<T: Serialize + ?Sized>(&mut self, document: &T) -> DriverResult<Bson> {
        let doc = bson::to_document(document)?;
        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.insert_one_with_session(doc, None, session).await?,
            None => self.inner.insert_one(doc, None).await?,
        };
        Ok(result.inserted_id)
    }

    /// Insert several documents in order, returning their `_id`s
    pub async fn insert_many<T: Serialize>(&mut self, documents: &[T]) -> DriverResult<Vec<Bson>> {
        let docs = documents
            .iter()
            .map(bson::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        let count = docs.len();

        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.insert_many_with_session(docs, None, session).await?,
            None => self.inner.insert_many(docs, None).await?,
        };
        let mut ids = result.inserted_ids;
        Ok((0..count).filter_map(|i| ids.remove(&i)).collect())
    }

    /// Matching documents in natural order
    pub async fn find(&mut self, filter: Document) -> DriverResult<Vec<Document>> {
        match self.session.as_deref_mut() {
            Some(session) => {
                let mut cursor = self.inner.find_with_session(filter, None, session).await?;
                let mut docs = Vec::new();
                while let Some(doc) = cursor.next(session).await {
                    docs.push(doc?);
                }
                Ok(docs)
            }
            None => Ok(self.inner.find(filter, None).await?.try_collect::<Vec<_>>().await?),
        }
    }

    pub async fn find_one(&mut self, filter: Document) -> DriverResult<Option<Document>> {
        let found = match self.session.as_deref_mut() {
            Some(session) => self.inner.find_one_with_session(filter, None, session).await?,
            None => self.inner.find_one(filter, None).await?,
        };
        Ok(found)
    }

    /// Find and deserialize matching documents
    pub async fn find_as<T: DeserializeOwned>(&mut self, filter: Document) -> DriverResult<Vec<T>> {
        self.find(filter)
            .await?
            .into_iter()
            .map(|doc| bson::from_document(doc).map_err(Into::into))
            .collect()
    }

    pub async fn count(&mut self, filter: Document) -> DriverResult<u64> {
        let count = match self.session.as_deref_mut() {
            Some(session) => self.inner.count_documents_with_session(filter, None, session).await?,
            None => self.inner.count_documents(filter, None).await?,
        };
        Ok(count)
    }

    pub async fn update_one(&mut self, filter: Document, update: Document) -> DriverResult<UpdateResult> {
        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.update_one_with_session(filter, update, None, session).await?,
            None => self.inner.update_one(filter, update, None).await?,
        };
        Ok(result)
    }

    pub async fn update_many(&mut self, filter: Document, update: Document) -> DriverResult<UpdateResult> {
        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.update_many_with_session(filter, update, None, session).await?,
            None => self.inner.update_many(filter, update, None).await?,
        };
        Ok(result)
    }

    /// Returns the number of deleted documents (0 or 1)
    pub async fn delete_one(&mut self, filter: Document) -> DriverResult<u64> {
        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.delete_one_with_session(filter, None, session).await?,
            None => self.inner.delete_one(filter, None).await?,
        };
        Ok(result.deleted_count)
    }

    pub async fn delete_many(&mut self, filter: Document) -> DriverResult<u64> {
        let result = match self.session.as_deref_mut() {
            Some(session) => self.inner.delete_many_with_session(filter, None, session).await?,
            None => self.inner.delete_many(filter, None).await?,
        };
        Ok(result.deleted_count)
    }

    /// Remove the whole collection
    pub async fn drop(&mut self) -> DriverResult<()> {
        match self.session.as_deref_mut() {
            Some(session) => self.inner.drop_with_session(None, session).await?,
            None => self.inner.drop(None).await?,
        }
        Ok(())
    }
}
