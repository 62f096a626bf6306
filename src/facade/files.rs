//! Checkpoint, history, and backup file management for [`StateStore`].
//!
//! State files live at `<base>.json` or `<base>.json.gz` depending on the
//! store's compression setting at write time; readers always accept both
//! forms. Writes remove the opposite form so a stale uncompressed file can
//! never shadow a fresh compressed one.
//!
//! Every helper has an `_at` variant addressing an explicit layout; the
//! plain variants use the live one. Migration needs both layouts at once.

use crate::blob;
use crate::checkpoint::Checkpoint;
use crate::core::{Result, StoreError, UpdateInfo};
use crate::encoding::{self, GZIP_EXT, JSON_EXT};
use crate::facade::StateStore;
use crate::refstore::{ReferenceStore, StackRef};
use chrono::Utc;

fn plain_path(refs: &dyn ReferenceStore, stack: &StackRef) -> String {
    format!("{}{}", refs.stack_base_path(stack), JSON_EXT)
}

fn gzip_path(refs: &dyn ReferenceStore, stack: &StackRef) -> String {
    format!("{}{}{}", refs.stack_base_path(stack), JSON_EXT, GZIP_EXT)
}

impl StateStore {
    /// Key of the checkpoint file this store would write for `stack`.
    pub(crate) fn stack_path(&self, stack: &StackRef) -> String {
        let refs = self.refs();
        if self.gzip {
            gzip_path(refs.as_ref(), stack)
        } else {
            plain_path(refs.as_ref(), stack)
        }
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Reads whichever form of the checkpoint file exists, decoding
    /// transparently.
    pub(crate) async fn read_stack_file_at(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.bucket.read(&plain_path(refs, stack)).await? {
            return Ok(Some(data));
        }
        match self.bucket.read(&gzip_path(refs, stack)).await? {
            Some(data) => Ok(Some(encoding::gzip_decompress(&data)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn checkpoint_exists_at(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
    ) -> Result<bool> {
        Ok(self.bucket.exists(&plain_path(refs, stack)).await?
            || self.bucket.exists(&gzip_path(refs, stack)).await?)
    }

    pub(crate) async fn checkpoint_exists(&self, stack: &StackRef) -> Result<bool> {
        self.checkpoint_exists_at(self.refs().as_ref(), stack).await
    }

    pub(crate) async fn load_checkpoint_at(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
    ) -> Result<Option<Checkpoint>> {
        match self.read_stack_file_at(refs, stack).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn load_checkpoint(&self, stack: &StackRef) -> Result<Option<Checkpoint>> {
        self.load_checkpoint_at(self.refs().as_ref(), stack).await
    }

    /// Writes the checkpoint in the store's current form and removes the
    /// opposite form.
    pub(crate) async fn save_checkpoint_at(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
        checkpoint: &Checkpoint,
    ) -> Result<String> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        let (target, stale) = if self.gzip {
            (gzip_path(refs, stack), plain_path(refs, stack))
        } else {
            (plain_path(refs, stack), gzip_path(refs, stack))
        };

        let payload = if self.gzip { encoding::gzip_compress(&data)? } else { data };
        self.bucket.write(&target, &payload).await?;

        match self.bucket.delete(&stale).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(target)
    }

    pub(crate) async fn save_checkpoint(
        &self,
        stack: &StackRef,
        checkpoint: &Checkpoint,
    ) -> Result<String> {
        self.save_checkpoint_at(self.refs().as_ref(), stack, checkpoint).await
    }

    /// Deletes both compression forms of the checkpoint. Missing files are
    /// fine as long as one existed.
    pub(crate) async fn delete_checkpoint(&self, stack: &StackRef) -> Result<()> {
        let refs = self.refs();
        let mut deleted = false;
        for key in [plain_path(refs.as_ref(), stack), gzip_path(refs.as_ref(), stack)] {
            match self.bucket.delete(&key).await {
                Ok(()) => deleted = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if deleted {
            Ok(())
        } else {
            Err(StoreError::BlobNotFound(stack.fully_qualified()))
        }
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Copies the current checkpoint file into the stack's backup directory
    /// under a timestamped name. Backups accumulate; nothing prunes them.
    pub(crate) async fn backup_stack(&self, stack: &StackRef) -> Result<()> {
        let refs = self.refs();
        let Some((key, file)) = self.existing_stack_file(refs.as_ref(), stack).await? else {
            return Ok(()); // nothing to back up
        };
        let backup_key =
            format!("{}/{}.{}", refs.backup_dir(stack), file, Utc::now().timestamp_millis());
        blob::copy_object(self.bucket.as_ref(), &key, &backup_key).await
    }

    /// Moves (or copies, when `keep_original`) the checkpoint file aside to
    /// `<file>.bak.<millis>` before a destructive overwrite.
    pub(crate) async fn backup_target_at(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
        keep_original: bool,
    ) -> Result<()> {
        let Some((key, _)) = self.existing_stack_file(refs, stack).await? else {
            return Ok(());
        };
        let backup_key = format!("{}.bak.{}", key, Utc::now().timestamp_millis());
        blob::copy_object(self.bucket.as_ref(), &key, &backup_key).await?;
        if !keep_original {
            self.bucket.delete(&key).await?;
        }
        Ok(())
    }

    pub(crate) async fn backup_target(&self, stack: &StackRef, keep_original: bool) -> Result<()> {
        self.backup_target_at(self.refs().as_ref(), stack, keep_original).await
    }

    /// Finds the checkpoint file's key and file name, whichever compression
    /// form is present.
    async fn existing_stack_file(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
    ) -> Result<Option<(String, String)>> {
        for key in [plain_path(refs, stack), gzip_path(refs, stack)] {
            if self.bucket.exists(&key).await? {
                let file = encoding::object_name(&key).to_string();
                return Ok(Some((key, file)));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // History
    // ========================================================================

    fn history_file_suffix(&self) -> &'static str {
        if self.gzip { ".history.json.gz" } else { ".history.json" }
    }

    /// Appends one history entry as `<name>-<seq>.history.json[.gz]`, with
    /// `seq` one past the highest existing entry.
    pub(crate) async fn add_to_history(&self, stack: &StackRef, info: &UpdateInfo) -> Result<()> {
        let refs = self.refs();
        let dir = refs.history_dir(stack);
        let next = self
            .history_entries(refs.as_ref(), stack)
            .await?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);

        let key = format!("{}/{}-{}{}", dir, stack.name(), next, self.history_file_suffix());
        let data = serde_json::to_vec_pretty(info)?;
        let payload = if self.gzip { encoding::gzip_compress(&data)? } else { data };
        self.bucket.write(&key, &payload).await
    }

    /// All history entry keys with their sequence numbers, ascending.
    async fn history_entries(
        &self,
        refs: &dyn ReferenceStore,
        stack: &StackRef,
    ) -> Result<Vec<(u64, String)>> {
        let prefix = format!("{}/", refs.history_dir(stack));
        let stem_prefix = format!("{}-", stack.name());

        let mut entries = Vec::new();
        for item in self.bucket.list(&prefix).await? {
            if item.is_dir {
                continue;
            }
            let file = encoding::object_name(&item.key);
            let Some(stem) = encoding::stack_file_name(file) else {
                continue;
            };
            let Some(stem) = stem.strip_suffix(".history") else {
                continue;
            };
            let Some(seq) = stem.strip_prefix(&stem_prefix).and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            entries.push((seq, item.key));
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries)
    }

    pub(crate) async fn read_history_page(
        &self,
        stack: &StackRef,
        page_size: usize,
        page: usize,
    ) -> Result<Vec<UpdateInfo>> {
        let refs = self.refs();
        let mut entries = self.history_entries(refs.as_ref(), stack).await?;
        entries.reverse(); // newest first

        let selected: Vec<(u64, String)> = if page_size == 0 {
            entries
        } else {
            let page = page.max(1);
            entries.into_iter().skip((page - 1) * page_size).take(page_size).collect()
        };

        let mut infos = Vec::with_capacity(selected.len());
        for (_, key) in selected {
            let Some(raw) = self.bucket.read(&key).await? else {
                continue; // raced with external cleanup
            };
            let data =
                if key.ends_with(GZIP_EXT) { encoding::gzip_decompress(&raw)? } else { raw };
            infos.push(serde_json::from_slice(&data)?);
        }
        Ok(infos)
    }

    /// Moves a stack's history directory between layouts and/or names,
    /// carrying the embedded stack name through each file name.
    pub(crate) async fn move_history(
        &self,
        old_refs: &dyn ReferenceStore,
        old_stack: &StackRef,
        new_refs: &dyn ReferenceStore,
        new_stack: &StackRef,
    ) -> Result<()> {
        let old_prefix = format!("{}/", old_refs.history_dir(old_stack));
        let new_dir = new_refs.history_dir(new_stack);

        for item in self.bucket.list(&old_prefix).await? {
            if item.is_dir {
                continue;
            }
            let file = encoding::object_name(&item.key);
            let renamed = file.replacen(
                &format!("{}-", old_stack.name()),
                &format!("{}-", new_stack.name()),
                1,
            );
            let new_key = format!("{}/{}", new_dir, renamed);
            blob::copy_object(self.bucket.as_ref(), &item.key, &new_key).await?;
            self.bucket.delete(&item.key).await?;
        }
        Ok(())
    }

    pub(crate) async fn rename_history(
        &self,
        old_stack: &StackRef,
        new_stack: &StackRef,
    ) -> Result<()> {
        let refs = self.refs();
        self.move_history(refs.as_ref(), old_stack, refs.as_ref(), new_stack).await
    }
}
