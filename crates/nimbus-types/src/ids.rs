strong_type!(FileId, u64);
strong_type!(ChunkId, u64);
strong_type!(ChunkVersion, u64, {
    /// Version stored in the file name of every unstable chunk.
    UNSTABLE = 0;
});
strong_type!(WriteId, u64);
strong_type!(DeviceId, u64);
strong_type!(NodeId, u32);
